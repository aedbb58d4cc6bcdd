//! Integration tests for the bucket cache and ticker lifecycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use quota_bucket::{BucketCache, CacheConfig, MemoryCounterStore, QuotaBucket};

fn async_bucket(quota_id: &str, sync_time_in_sec: i64) -> Arc<QuotaBucket> {
    Arc::new(
        QuotaBucket::new(
            "sampleOrg",
            quota_id,
            1,
            "hour",
            "calendar",
            true,
            Utc::now().timestamp() - 60,
            100,
            1,
            true,
            false,
            sync_time_in_sec,
            -1,
        )
        .unwrap(),
    )
}

#[tokio::test(start_paused = true)]
async fn test_expired_entry_stops_ticker_once() {
    let store = Arc::new(MemoryCounterStore::new());
    let cache = BucketCache::new(CacheConfig::default().with_ttl(Duration::from_secs(30)));

    let bucket = async_bucket("sampleID", 1);
    assert!(bucket.start_sync_ticker(store.clone()).unwrap());
    cache.put(bucket.clone());

    let hit = cache.get("sampleOrg~sampleID", 1).unwrap();
    assert!(hit.is_some(), "Fresh entry should be found");

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(cache.get("sampleOrg~sampleID", 1).unwrap().is_none());

    let state = bucket.async_state().unwrap();
    assert_eq!(state.ticker_stop_count(), 1);
    assert!(!state.has_ticker());
    assert!(state.is_stopped());

    // Later teardown does not stop it again
    cache.clear();
    drop(cache);
    assert_eq!(state.ticker_stop_count(), 1);

    // A stopped bucket cannot get a new ticker
    assert!(!bucket.start_sync_ticker(store).unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_evicted_counts_reach_store() {
    let store = Arc::new(MemoryCounterStore::new());
    let cache = BucketCache::new(CacheConfig::default());
    let bucket = async_bucket("sampleID", 1);
    bucket.start_sync_ticker(store.clone()).unwrap();
    cache.put(bucket.clone());

    let result = bucket.increment_quota_count(store.as_ref(), 3).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let stored = quota_bucket::CounterStore::get_count(
        store.as_ref(),
        "sampleOrg",
        "sampleID",
        result.window_start,
        result.window_end,
    )
    .await
    .unwrap();
    assert_eq!(stored, 3);

    bucket.increment_quota_count(store.as_ref(), 2).await.unwrap();
    assert!(cache.evict("sampleOrg~sampleID").unwrap());
    tokio::time::sleep(Duration::from_secs(5)).await;

    // The stopped ticker no longer flushes; the eviction queue holds the rest.
    let stored = quota_bucket::CounterStore::get_count(
        store.as_ref(),
        "sampleOrg",
        "sampleID",
        result.window_start,
        result.window_end,
    )
    .await
    .unwrap();
    assert_eq!(stored, 3);

    let evicted = cache.take_evicted();
    assert_eq!(evicted.len(), 1);
    for bucket in &evicted {
        bucket.flush_evicted(store.as_ref()).await.unwrap();
    }

    let stored = quota_bucket::CounterStore::get_count(
        store.as_ref(),
        "sampleOrg",
        "sampleID",
        result.window_start,
        result.window_end,
    )
    .await
    .unwrap();
    assert_eq!(stored, 5);
    assert_eq!(bucket.async_state().unwrap().unflushed(), 0);
}

#[tokio::test]
async fn test_drop_stops_every_ticker() {
    let store = Arc::new(MemoryCounterStore::new());
    let cache = BucketCache::new(CacheConfig::default());

    let buckets: Vec<_> = (0..3)
        .map(|i| async_bucket(&format!("q{}", i), 60))
        .collect();
    for bucket in &buckets {
        bucket.start_sync_ticker(store.clone()).unwrap();
        cache.put(bucket.clone());
    }
    assert_eq!(cache.len(), 3);

    drop(cache);
    for bucket in &buckets {
        assert_eq!(bucket.async_state().unwrap().ticker_stop_count(), 1);
    }
}

#[tokio::test]
async fn test_concurrent_gets_share_one_bucket() {
    let cache = Arc::new(BucketCache::new(CacheConfig::default()));
    cache.put(async_bucket("shared", 60));

    let mut handles = Vec::new();
    for weight in 1..=8 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move {
            cache.get("sampleOrg~shared", weight).unwrap().unwrap()
        }));
    }

    let first = cache.get("sampleOrg~shared", 1).unwrap().unwrap();
    for handle in handles {
        let bucket = handle.await.unwrap();
        assert!(Arc::ptr_eq(&bucket, &first));
    }
    assert_eq!(cache.len(), 1);
}
