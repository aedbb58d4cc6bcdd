//! Cache of live quota buckets.
//!
//! Buckets are keyed by `tenant~quota` and expire after a TTL that slides
//! forward on every hit. Removing an asynchronous bucket stops its sync
//! ticker before the entry leaves the map, so no ticker outlives its entry,
//! and queues the bucket until what it still owes the store is written.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bucket::QuotaBucket;
use crate::error::{QuotaError, Result};
use crate::strategy::BucketMode;

/// Bucket cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long an entry lives without being hit (default: 10 minutes).
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
        }
    }
}

impl CacheConfig {
    /// Set the entry TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

#[derive(Debug)]
struct CacheEntry {
    bucket: Arc<QuotaBucket>,
    expires_at: Instant,
}

/// Concurrent map from cache key to bucket.
///
/// Evicted asynchronous buckets are queued until their owed counts are
/// written, see [`take_evicted`](Self::take_evicted).
///
/// # Example
///
/// ```ignore
/// use quota_bucket::{BucketCache, CacheConfig};
///
/// let cache = BucketCache::new(CacheConfig::default());
/// cache.put(bucket.clone());
/// let hit = cache.get("acme~search", 1)?;
/// ```
#[derive(Debug, Default)]
pub struct BucketCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    evicted: Mutex<Vec<Arc<QuotaBucket>>>,
    config: CacheConfig,
}

impl BucketCache {
    /// Create an empty cache.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            evicted: Mutex::new(Vec::new()),
            config,
        }
    }

    /// Entry TTL.
    pub fn ttl(&self) -> Duration {
        self.config.ttl
    }

    /// Look up a bucket, overriding its weight and sliding its expiry.
    ///
    /// An expired entry is evicted and reported as missing.
    pub fn get(&self, key: &str, weight: i64) -> Result<Option<Arc<QuotaBucket>>> {
        let mut entries = self.entries.lock();
        self.touch_locked(&mut entries, key, weight)
    }

    /// Look up a bucket like [`get`](Self::get), building and inserting one
    /// with `build` on a miss.
    ///
    /// The lookup, the build and the insert happen under one lock hold, so
    /// concurrent misses on a key end up sharing one bucket. Returns the
    /// bucket and whether this call inserted it.
    pub fn get_or_insert_with<F>(
        &self,
        key: &str,
        weight: i64,
        build: F,
    ) -> Result<(Arc<QuotaBucket>, bool)>
    where
        F: FnOnce() -> Result<QuotaBucket>,
    {
        let mut entries = self.entries.lock();
        if let Some(bucket) = self.touch_locked(&mut entries, key, weight)? {
            return Ok((bucket, false));
        }

        let bucket = Arc::new(build()?);
        entries.insert(
            key.to_string(),
            CacheEntry {
                bucket: bucket.clone(),
                expires_at: Instant::now() + self.config.ttl,
            },
        );
        Ok((bucket, true))
    }

    /// Insert or replace a bucket.
    ///
    /// A replaced asynchronous bucket has its ticker stopped.
    pub fn put(&self, bucket: Arc<QuotaBucket>) {
        let entry = CacheEntry {
            bucket: bucket.clone(),
            expires_at: Instant::now() + self.config.ttl,
        };

        let mut entries = self.entries.lock();
        let replaced = entries.insert(bucket.cache_key().to_string(), entry);
        if let Some(old) = replaced.filter(|old| !Arc::ptr_eq(&old.bucket, &bucket)) {
            self.retire(old.bucket);
        }
    }

    /// Remove a bucket, stopping its ticker first.
    ///
    /// Returns whether an entry was removed. Fails when an asynchronous
    /// bucket has lost its async state; the entry stays in place then.
    pub fn evict(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        if !entries.contains_key(key) {
            return Ok(false);
        }
        self.evict_locked(&mut entries, key)?;
        Ok(true)
    }

    /// Evict every expired entry and return how many were removed.
    pub fn purge_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.evict_locked(&mut entries, key)?;
        }
        Ok(expired.len())
    }

    /// Take the evicted asynchronous buckets queued since the last call.
    ///
    /// Their stopped state may still owe the store counts; write them with
    /// [`QuotaBucket::flush_evicted`].
    pub fn take_evicted(&self) -> Vec<Arc<QuotaBucket>> {
        std::mem::take(&mut *self.evicted.lock())
    }

    /// Queue evicted buckets again, typically after a failed flush.
    pub fn requeue_evicted(&self, buckets: impl IntoIterator<Item = Arc<QuotaBucket>>) {
        self.evicted.lock().extend(buckets);
    }

    /// Snapshot of every cached bucket.
    pub fn buckets(&self) -> Vec<Arc<QuotaBucket>> {
        self.entries
            .lock()
            .values()
            .map(|entry| entry.bucket.clone())
            .collect()
    }

    /// Number of cached buckets.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Stop every ticker and empty the cache.
    ///
    /// Asynchronous buckets are queued as evicted.
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        for (_, entry) in entries.drain() {
            self.retire(entry.bucket);
        }
    }

    /// Refresh a live entry; evict an expired one.
    fn touch_locked(
        &self,
        entries: &mut HashMap<String, CacheEntry>,
        key: &str,
        weight: i64,
    ) -> Result<Option<Arc<QuotaBucket>>> {
        let now = Instant::now();
        let Some(entry) = entries.get_mut(key) else {
            return Ok(None);
        };
        if entry.expires_at > now {
            entry.bucket.set_weight(weight);
            entry.expires_at = now + self.config.ttl;
            return Ok(Some(entry.bucket.clone()));
        }

        debug!(key, "bucket cache entry expired");
        self.evict_locked(entries, key)?;
        Ok(None)
    }

    /// Remove `key` from a locked map, stopping an async bucket's ticker first.
    fn evict_locked(&self, entries: &mut HashMap<String, CacheEntry>, key: &str) -> Result<()> {
        let Some(entry) = entries.get(key) else {
            return Ok(());
        };

        if matches!(entry.bucket.mode(), BucketMode::Asynchronous)
            && entry.bucket.async_state().is_none()
        {
            return Err(QuotaError::AsyncStateMissing(key.to_string()));
        }
        self.retire(entry.bucket.clone());

        entries.remove(key);
        info!(key, "quota bucket evicted");
        Ok(())
    }

    /// Stop an outgoing bucket's state and queue it for a final flush.
    fn retire(&self, bucket: Arc<QuotaBucket>) {
        if let Some(state) = bucket.async_state() {
            state.stop(bucket.cache_key());
            self.evicted.lock().push(bucket);
        }
    }
}

impl Drop for BucketCache {
    fn drop(&mut self) {
        let mut owed = 0;
        for entry in self.entries.get_mut().values() {
            if let Some(state) = entry.bucket.async_state() {
                state.stop(entry.bucket.cache_key());
                owed += state.unflushed();
            }
        }
        for bucket in self.evicted.get_mut().iter() {
            owed += bucket.async_state().map_or(0, |state| state.unflushed());
        }
        if owed != 0 {
            warn!(owed, "bucket cache dropped with unflushed counts");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn plain(quota_id: &str, synchronous: bool) -> QuotaBucket {
        let sync_time = if synchronous { -1 } else { 30 };
        QuotaBucket::new(
            "sampleOrg",
            quota_id,
            1,
            "hour",
            "calendar",
            true,
            Utc::now().timestamp(),
            10,
            1,
            true,
            synchronous,
            sync_time,
            -1,
        )
        .unwrap()
    }

    fn bucket(quota_id: &str, synchronous: bool) -> Arc<QuotaBucket> {
        Arc::new(plain(quota_id, synchronous))
    }

    #[test]
    fn test_cache_config_default() {
        let config = CacheConfig::default().with_ttl(Duration::from_secs(5));
        assert_eq!(config.ttl, Duration::from_secs(5));
        assert_eq!(BucketCache::default().ttl(), Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_put_then_get_overrides_weight() {
        let cache = BucketCache::new(CacheConfig::default());
        cache.put(bucket("q1", true));

        let hit = cache.get("sampleOrg~q1", 4).unwrap().unwrap();
        assert_eq!(hit.weight(), 4);
        assert!(cache.get("sampleOrg~missing", 1).unwrap().is_none());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_slides_expiry() {
        let cache = BucketCache::new(CacheConfig::default().with_ttl(Duration::from_secs(10)));
        cache.put(bucket("q1", true));

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(cache.get("sampleOrg~q1", 1).unwrap().is_some());
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(cache.get("sampleOrg~q1", 1).unwrap().is_some());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cache.get("sampleOrg~q1", 1).unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_evict_missing_async_state() {
        let cache = BucketCache::new(CacheConfig::default());
        let broken = plain("q1", false).without_async_state();
        cache.put(Arc::new(broken));

        let err = cache.evict("sampleOrg~q1").unwrap_err();
        assert!(matches!(err, QuotaError::AsyncStateMissing(_)));
        assert_eq!(cache.len(), 1);
        assert!(!cache.evict("sampleOrg~other").unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = BucketCache::new(CacheConfig::default().with_ttl(Duration::from_secs(10)));
        cache.put(bucket("q1", true));
        tokio::time::advance(Duration::from_secs(5)).await;
        cache.put(bucket("q2", true));
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(cache.purge_expired().unwrap(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("sampleOrg~q2", 1).unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_or_insert_builds_once() {
        let cache = BucketCache::new(CacheConfig::default().with_ttl(Duration::from_secs(10)));

        let (first, inserted) = cache
            .get_or_insert_with("sampleOrg~q1", 1, || Ok(plain("q1", false)))
            .unwrap();
        assert!(inserted);

        let (hit, inserted) = cache
            .get_or_insert_with("sampleOrg~q1", 3, || panic!("Live entry must not be rebuilt"))
            .unwrap();
        assert!(!inserted);
        assert!(Arc::ptr_eq(&first, &hit));
        assert_eq!(hit.weight(), 3);

        tokio::time::advance(Duration::from_secs(11)).await;
        let (fresh, inserted) = cache
            .get_or_insert_with("sampleOrg~q1", 1, || Ok(plain("q1", false)))
            .unwrap();
        assert!(inserted);
        assert!(!Arc::ptr_eq(&first, &fresh));
        assert!(first.async_state().unwrap().is_stopped());

        let evicted = cache.take_evicted();
        assert_eq!(evicted.len(), 1);
        assert!(Arc::ptr_eq(&evicted[0], &first));
        assert!(cache.take_evicted().is_empty());
    }

    #[test]
    fn test_get_or_insert_build_error_inserts_nothing() {
        let cache = BucketCache::new(CacheConfig::default());
        let err = cache
            .get_or_insert_with("sampleOrg~q1", 1, || {
                Err(QuotaError::Internal("build failed".into()))
            })
            .unwrap_err();
        assert!(matches!(err, QuotaError::Internal(_)));
        assert!(cache.is_empty());
    }

    #[cfg(feature = "memory")]
    #[tokio::test]
    async fn test_replace_and_clear_stop_tickers() {
        let store = Arc::new(crate::storage::MemoryCounterStore::new());
        let cache = BucketCache::new(CacheConfig::default());

        let first = bucket("q1", false);
        assert!(first.start_sync_ticker(store.clone()).unwrap());
        cache.put(first.clone());

        let second = bucket("q1", false);
        assert!(second.start_sync_ticker(store).unwrap());
        cache.put(second.clone());

        let first_state = first.async_state().unwrap();
        assert_eq!(first_state.ticker_stop_count(), 1);
        assert!(first_state.is_stopped());

        cache.clear();
        let second_state = second.async_state().unwrap();
        assert_eq!(second_state.ticker_stop_count(), 1);
        assert!(cache.is_empty());
    }
}
