//! Quota manager: resolves requests to cached buckets and applies them.
//!
//! The `QuotaManager` owns the bucket cache and the counter store. A request
//! names its tenant and quota and carries the full quota configuration; the
//! first request for a key builds the bucket, later ones reuse it until the
//! cache entry expires.
//!
//! # Example
//!
//! ```ignore
//! use quota_bucket::{QuotaManager, QuotaRequest, MemoryCounterStore};
//!
//! let manager = QuotaManager::new(MemoryCounterStore::new());
//! let request = QuotaRequest::from_json(body)?;
//! let result = manager.apply(&request).await?;
//! if result.exceeded {
//!     // reject the call
//! }
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bucket::QuotaBucket;
use crate::cache::{BucketCache, CacheConfig};
use crate::error::{QuotaError, Result};
use crate::quota::QuotaConfig;
use crate::result::QuotaBucketResult;
use crate::storage::CounterStore;

/// A request to charge or reset a quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRequest {
    /// Quota configuration, including the request weight.
    #[serde(flatten)]
    pub config: QuotaConfig,
}

impl QuotaRequest {
    /// Create a request from a quota configuration.
    pub fn new(config: QuotaConfig) -> Self {
        Self { config }
    }

    /// Decode a JSON request body.
    pub fn from_json(body: &str) -> Result<Self> {
        serde_json::from_str(body).map_err(|e| QuotaError::InvalidRequest(e.to_string()))
    }

    /// Cache key of the addressed bucket.
    pub fn cache_key(&self) -> String {
        self.config.cache_key()
    }

    /// Request weight.
    pub fn weight(&self) -> i64 {
        self.config.weight
    }
}

impl From<QuotaConfig> for QuotaRequest {
    fn from(config: QuotaConfig) -> Self {
        Self::new(config)
    }
}

/// Manager for quota buckets.
pub struct QuotaManager<S> {
    cache: BucketCache,
    store: Arc<S>,
}

impl<S> std::fmt::Debug for QuotaManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaManager")
            .field("buckets", &self.cache.len())
            .field("ttl", &self.cache.ttl())
            .finish()
    }
}

impl<S: CounterStore> QuotaManager<S> {
    /// Create a manager with the default cache configuration.
    pub fn new(store: S) -> Self {
        Self::with_config(store, CacheConfig::default())
    }

    /// Create a manager with a custom cache configuration.
    pub fn with_config(store: S, config: CacheConfig) -> Self {
        Self::from_shared(Arc::new(store), config)
    }

    /// Create a manager over a store shared with other components.
    pub fn from_shared(store: Arc<S>, config: CacheConfig) -> Self {
        Self {
            cache: BucketCache::new(config),
            store,
        }
    }

    /// Bucket cache.
    pub fn cache(&self) -> &BucketCache {
        &self.cache
    }

    /// Counter store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Fetch the cached bucket for a request, building and caching it on a
    /// miss.
    ///
    /// Concurrent misses on one key resolve to the same bucket; only the
    /// call that inserted it starts its sync ticker.
    pub fn bucket(&self, request: &QuotaRequest) -> Result<Arc<QuotaBucket>> {
        let key = request.cache_key();
        let (bucket, inserted) = self.cache.get_or_insert_with(&key, request.weight(), || {
            QuotaBucket::from_config(request.config.clone())
        })?;

        if inserted {
            bucket.start_sync_ticker(self.store.clone())?;
            debug!(key = %key, mode = %bucket.mode(), "quota bucket created");
        }
        Ok(bucket)
    }

    /// Charge a request against its quota.
    pub async fn apply(&self, request: &QuotaRequest) -> Result<QuotaBucketResult> {
        let bucket = self.bucket(request)?;
        self.settle_evicted().await;
        bucket
            .increment_quota_count(self.store.as_ref(), request.weight())
            .await
    }

    /// Take the bucket's last weight back out of the current window.
    pub async fn reset_quota(&self, request: &QuotaRequest) -> Result<QuotaBucketResult> {
        let bucket = self.bucket(request)?;
        self.settle_evicted().await;
        bucket.reset_quota_for_current_period(self.store.as_ref()).await
    }

    /// Write the counts still owed by evicted buckets.
    ///
    /// Buckets whose write fails are queued again; the first failure is
    /// returned.
    pub async fn flush_evicted(&self) -> Result<()> {
        let mut first_err = None;
        let mut failed = Vec::new();
        for bucket in self.cache.take_evicted() {
            if let Err(err) = bucket.flush_evicted(self.store.as_ref()).await {
                warn!(key = bucket.cache_key(), error = %err, "flush of evicted bucket failed");
                first_err.get_or_insert(err);
                failed.push(bucket);
            }
        }
        self.cache.requeue_evicted(failed);
        first_err.map_or(Ok(()), Err)
    }

    /// Flush evicted buckets on the request path without failing the request.
    async fn settle_evicted(&self) {
        // Already logged; failed buckets stay queued.
        let _ = self.flush_evicted().await;
    }

    /// Flush every buffered count and empty the cache.
    ///
    /// Every bucket is flushed even if one fails; the first failure is
    /// returned after the cache is cleared.
    pub async fn shutdown(&self) -> Result<()> {
        let mut first_err = None;
        for bucket in self.cache.buckets() {
            if let Err(err) = bucket.flush(self.store.as_ref()).await {
                warn!(key = bucket.cache_key(), error = %err, "flush on shutdown failed");
                first_err.get_or_insert(err);
            }
        }
        self.cache.clear();
        if let Err(err) = self.flush_evicted().await {
            first_err.get_or_insert(err);
        }
        first_err.map_or(Ok(()), Err)
    }
}
