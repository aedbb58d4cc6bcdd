//! Counter store trait and implementations.
//!
//! The counter store is the durable, shared record of how many weighted calls
//! each (tenant, quota, window) has seen. Buckets read from it and increment
//! it; its replication and consistency belong to the backend.

#[cfg(feature = "memory")]
mod memory_gc;
#[cfg(feature = "redis")]
mod redis_cluster;

#[cfg(feature = "memory")]
pub use memory_gc::{GcConfig, GcInterval, MemoryCounterStore};

// RedisCounterStore with connection pooling
#[cfg(feature = "redis")]
pub use redis_cluster::{RedisConfig, RedisCounterStore};

use std::future::Future;

use crate::error::Result;

/// Counter store backend trait.
///
/// All operations are async to support both local and distributed backends.
/// Implementations must be thread-safe (`Send + Sync`).
///
/// A counter is addressed by tenant, quota id and the window bounds in Unix
/// seconds. Counters that were never incremented read as zero.
///
/// # Example
///
/// ```ignore
/// use quota_bucket::storage::{CounterStore, MemoryCounterStore};
///
/// async fn example<S: CounterStore>(store: &S) -> quota_bucket::Result<()> {
///     let count = store.increment_and_get_count("acme", "search", 1, 0, 3600).await?;
///     assert_eq!(store.get_count("acme", "search", 0, 3600).await?, count);
///     Ok(())
/// }
/// ```
pub trait CounterStore: Send + Sync + 'static {
    /// Read the count of a window.
    fn get_count(
        &self,
        tenant_id: &str,
        quota_id: &str,
        window_start: i64,
        window_end: i64,
    ) -> impl Future<Output = Result<i64>> + Send;

    /// Atomically add `delta` to a window and return the new count.
    ///
    /// `delta` may be negative to compensate an earlier increment.
    fn increment_and_get_count(
        &self,
        tenant_id: &str,
        quota_id: &str,
        delta: i64,
        window_start: i64,
        window_end: i64,
    ) -> impl Future<Output = Result<i64>> + Send;
}

impl<S: CounterStore + ?Sized> CounterStore for std::sync::Arc<S> {
    async fn get_count(
        &self,
        tenant_id: &str,
        quota_id: &str,
        window_start: i64,
        window_end: i64,
    ) -> Result<i64> {
        (**self)
            .get_count(tenant_id, quota_id, window_start, window_end)
            .await
    }

    async fn increment_and_get_count(
        &self,
        tenant_id: &str,
        quota_id: &str,
        delta: i64,
        window_start: i64,
        window_end: i64,
    ) -> Result<i64> {
        (**self)
            .increment_and_get_count(tenant_id, quota_id, delta, window_start, window_end)
            .await
    }
}

impl<S: CounterStore + ?Sized> CounterStore for Box<S> {
    async fn get_count(
        &self,
        tenant_id: &str,
        quota_id: &str,
        window_start: i64,
        window_end: i64,
    ) -> Result<i64> {
        (**self)
            .get_count(tenant_id, quota_id, window_start, window_end)
            .await
    }

    async fn increment_and_get_count(
        &self,
        tenant_id: &str,
        quota_id: &str,
        delta: i64,
        window_start: i64,
        window_end: i64,
    ) -> Result<i64> {
        (**self)
            .increment_and_get_count(tenant_id, quota_id, delta, window_start, window_end)
            .await
    }
}

/// Build the store key of a window counter.
pub fn counter_key(tenant_id: &str, quota_id: &str, window_start: i64, window_end: i64) -> String {
    format!("{}:{}:{}:{}", tenant_id, quota_id, window_start, window_end)
}

/// Get the current timestamp in seconds since Unix epoch.
pub fn current_timestamp_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
