//! Quota buckets for multi-tenant API quotas.
//!
//! `quota_bucket` decides whether a tenant's call fits in its quota for the
//! current time window:
//!
//! - **Periods**: calendar windows aligned to natural unit boundaries, or
//!   rolling windows anchored at the quota's start time
//! - **Counting modes**: synchronous (every call hits the counter store),
//!   asynchronous (buffered, flushed on a ticker or message threshold), and
//!   non-distributed (counted in process)
//! - **Bucket cache**: TTL cache of live buckets that stops sync tickers on
//!   eviction
//! - **Pluggable counter stores**: in-memory with GC, Redis with connection
//!   pooling
//!
//! # Quick Start
//!
//! ```ignore
//! use quota_bucket::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> quota_bucket::Result<()> {
//!     let manager = QuotaManager::new(MemoryCounterStore::new());
//!
//!     let request = QuotaRequest::new(
//!         QuotaConfig::builder()
//!             .tenant_id("acme")
//!             .quota_id("search")
//!             .time_unit("hour")
//!             .quota_type("calendar")
//!             .start_time(1_700_000_000)
//!             .max_count(1000)
//!             .build()?,
//!     );
//!
//!     let result = manager.apply(&request).await?;
//!     if result.exceeded {
//!         println!("Quota exceeded, {} used", result.current_count);
//!     } else {
//!         println!("Allowed, {} remaining", result.remaining());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Feature Flags
//!
//! - `memory` (default): In-memory counter store with garbage collection
//! - `redis`: Redis counter store

pub mod bucket;
pub mod cache;
pub mod error;
pub mod manager;
pub mod period;
pub mod quota;
pub mod result;
pub mod storage;
pub mod strategy;

// Re-export main types
pub use bucket::{AsyncState, QuotaBucket};
pub use cache::{BucketCache, CacheConfig};
pub use error::{ConfigError, QuotaError, Result, StorageError};
pub use manager::{QuotaManager, QuotaRequest};
pub use period::{Period, QuotaKind, TimeUnit};
pub use quota::{CACHE_KEY_DELIMITER, QuotaConfig, QuotaConfigBuilder, cache_key};
pub use result::QuotaBucketResult;
pub use storage::CounterStore;
pub use strategy::BucketMode;

// Re-export storage types
#[cfg(feature = "memory")]
pub use storage::{GcConfig, GcInterval, MemoryCounterStore};

#[cfg(feature = "redis")]
pub use storage::{RedisConfig, RedisCounterStore};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::bucket::QuotaBucket;
    pub use crate::cache::{BucketCache, CacheConfig};
    pub use crate::error::{QuotaError, Result};
    pub use crate::manager::{QuotaManager, QuotaRequest};
    pub use crate::period::{Period, QuotaKind, TimeUnit};
    pub use crate::quota::QuotaConfig;
    pub use crate::result::QuotaBucketResult;
    pub use crate::storage::CounterStore;
    pub use crate::strategy::BucketMode;

    #[cfg(feature = "memory")]
    pub use crate::storage::{GcConfig, GcInterval, MemoryCounterStore};
}

#[cfg(test)]
mod tests {
    #[cfg(feature = "memory")]
    #[tokio::test]
    async fn test_integration_non_distributed() {
        use crate::prelude::*;

        let store = MemoryCounterStore::new();
        let bucket = QuotaBucket::new(
            "org", "local", 1, "day", "calendar", true, 0, 3, 1, false, true, -1, -1,
        )
        .unwrap();

        for i in 1..=3 {
            let result = bucket.increment_quota_count(&store, 1).await.unwrap();
            assert!(result.is_allowed(), "Call {} should be allowed", i);
        }
        let result = bucket.increment_quota_count(&store, 1).await.unwrap();
        assert!(result.exceeded);
        assert_eq!(result.current_count, 3);

        // Nothing reached the shared store
        assert!(store.is_empty());

        bucket.reset_count().unwrap();
        let result = bucket.increment_quota_count(&store, 1).await.unwrap();
        assert_eq!(result.current_count, 1);
    }

    #[cfg(feature = "memory")]
    #[tokio::test]
    async fn test_integration_weighted_reset() {
        use crate::prelude::*;

        let store = MemoryCounterStore::new();
        let bucket = QuotaBucket::new(
            "org", "weighted", 1, "day", "calendar", true, 0, 10, 1, true, true, -1, -1,
        )
        .unwrap();

        let result = bucket.increment_quota_count(&store, 4).await.unwrap();
        assert_eq!(result.current_count, 4);
        assert_eq!(result.remaining(), 6);

        let result = bucket.reset_quota_for_current_period(&store).await.unwrap();
        assert_eq!(result.current_count, 0);
        assert!(!result.exceeded);
    }
}
