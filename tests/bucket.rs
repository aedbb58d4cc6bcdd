//! Integration tests for bucket construction and the counting modes.

use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{TimeDelta, Utc};
use quota_bucket::{
    BucketMode, ConfigError, CounterStore, MemoryCounterStore, QuotaBucket, QuotaConfig,
    QuotaError, QuotaManager, QuotaRequest, Result, StorageError,
};

/// Memory store that counts the increments it receives.
#[derive(Debug, Default)]
struct CountingStore {
    inner: MemoryCounterStore,
    increments: AtomicUsize,
}

impl CountingStore {
    fn increments(&self) -> usize {
        self.increments.load(Ordering::SeqCst)
    }
}

impl CounterStore for CountingStore {
    async fn get_count(
        &self,
        tenant_id: &str,
        quota_id: &str,
        window_start: i64,
        window_end: i64,
    ) -> Result<i64> {
        self.inner
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
        self.increments.fetch_add(1, Ordering::SeqCst);
        self.inner
            .increment_and_get_count(tenant_id, quota_id, delta, window_start, window_end)
            .await
    }
}

/// Store whose every operation fails.
#[derive(Debug, Default)]
struct UnavailableStore;

impl CounterStore for UnavailableStore {
    async fn get_count(&self, _: &str, _: &str, _: i64, _: i64) -> Result<i64> {
        Err(StorageError::ConnectionFailed("store unavailable".into()).into())
    }

    async fn increment_and_get_count(
        &self,
        _: &str,
        _: &str,
        _: i64,
        _: i64,
        _: i64,
    ) -> Result<i64> {
        Err(StorageError::ConnectionFailed("store unavailable".into()).into())
    }
}

fn daily(distributed: bool, synchronous: bool, sync_message_count: i64) -> QuotaBucket {
    let start = (Utc::now() - TimeDelta::days(3)).timestamp();
    QuotaBucket::new(
        "sampleOrg",
        "sampleID",
        1,
        "day",
        "calendar",
        true,
        start,
        10,
        1,
        distributed,
        synchronous,
        -1,
        sync_message_count,
    )
    .unwrap()
}

async fn seed(store: &CountingStore, bucket: &QuotaBucket, count: i64) {
    let period = bucket.period().unwrap();
    store
        .inner
        .increment_and_get_count(
            bucket.tenant_id(),
            bucket.quota_id(),
            count,
            period.start_unix(),
            period.end_unix(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_synchronous_fills_to_max_then_exceeds() {
    let store = CountingStore::default();
    let bucket = daily(true, true, -1);
    seed(&store, &bucket, 9).await;

    let result = bucket.increment_quota_count(&store, 1).await.unwrap();
    assert_eq!(result.current_count, 10);
    assert!(!result.exceeded);
    assert_eq!(store.increments(), 1);

    let result = bucket.increment_quota_count(&store, 1).await.unwrap();
    assert_eq!(result.current_count, 10);
    assert!(result.exceeded, "Call past max should be exceeded");
    assert_eq!(store.increments(), 1, "Rejected call must not touch the store");
}

#[tokio::test]
async fn test_synchronous_zero_weight_on_full_bucket() {
    let store = CountingStore::default();
    let bucket = daily(true, true, -1);
    seed(&store, &bucket, 10).await;

    let result = bucket.increment_quota_count(&store, 0).await.unwrap();
    assert!(result.exceeded);
    assert_eq!(result.current_count, 10);
    assert_eq!(store.increments(), 0);
}

#[tokio::test]
async fn test_synchronous_weight_larger_than_headroom() {
    let store = CountingStore::default();
    let bucket = daily(true, true, -1);
    seed(&store, &bucket, 8).await;

    let result = bucket.increment_quota_count(&store, 3).await.unwrap();
    assert!(result.exceeded);
    assert_eq!(result.current_count, 11);
    assert_eq!(store.increments(), 0);
}

#[tokio::test]
async fn test_stale_period_is_not_counted() {
    let store = CountingStore::default();
    let start = (Utc::now() + TimeDelta::days(30)).timestamp();

    for (distributed, synchronous) in [(true, true), (true, false), (false, true)] {
        let bucket = QuotaBucket::new(
            "sampleOrg", "future", 1, "hour", "calendar", true, start, 10, 1, distributed,
            synchronous, -1, -1,
        )
        .unwrap();

        let result = bucket.increment_quota_count(&store, 1).await.unwrap();
        assert!(!result.exceeded);
        assert_eq!(result.current_count, 0, "{} should not count", bucket.mode());
    }
    assert_eq!(store.increments(), 0);
}

#[tokio::test]
async fn test_store_errors_propagate() {
    let bucket = daily(true, true, -1);
    let err = bucket
        .increment_quota_count(&UnavailableStore, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, QuotaError::Storage(StorageError::ConnectionFailed(_))));
}

#[tokio::test]
async fn test_async_failed_flush_keeps_delta() {
    let store = CountingStore::default();
    let bucket = daily(true, false, 2);

    // Hydrate against a working store, then lose it.
    bucket.increment_quota_count(&store, 1).await.unwrap();
    let err = bucket
        .increment_quota_count(&UnavailableStore, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, QuotaError::Storage(_)));

    let state = bucket.async_state().unwrap();
    assert_eq!(state.pending(), 2);
    assert_eq!(state.local_count(), 2);

    bucket.flush(&store).await.unwrap();
    assert_eq!(state.pending(), 0);
    assert_eq!(store.increments(), 1);
}

#[tokio::test]
async fn test_non_distributed_never_touches_store() {
    let store = CountingStore::default();
    let bucket = daily(false, true, -1);
    assert_eq!(bucket.mode(), BucketMode::NonDistributed);

    for expected in 1..=10 {
        let result = bucket.increment_quota_count(&store, 1).await.unwrap();
        assert_eq!(result.current_count, expected);
    }
    let result = bucket.increment_quota_count(&store, 1).await.unwrap();
    assert!(result.exceeded);

    let result = bucket.reset_quota_for_current_period(&store).await.unwrap();
    assert_eq!(result.current_count, 9);
    assert_eq!(store.increments(), 0);
}

#[test]
fn test_reset_count_clears_local_counter() {
    let store = CountingStore::default();
    let bucket = daily(false, true, -1);

    tokio_test::block_on(async {
        for _ in 0..4 {
            bucket.increment_quota_count(&store, 2).await.unwrap();
        }
        let result = bucket.increment_quota_count(&store, 2).await.unwrap();
        assert_eq!(result.current_count, 10);

        bucket.reset_count().unwrap();
        let result = bucket.increment_quota_count(&store, 2).await.unwrap();
        assert_eq!(result.current_count, 2);
        assert!(!result.exceeded);
    });

    // Synchronous buckets hold nothing locally
    tokio_test::assert_ok!(daily(true, true, -1).reset_count());
}

#[test]
fn test_construction_rejections() {
    let start = Utc::now().timestamp();
    let build = |unit: &str, kind: &str, distributed, synchronous, secs, count| {
        QuotaBucket::new(
            "sampleOrg", "sampleID", 1, unit, kind, true, start, 10, 1, distributed, synchronous,
            secs, count,
        )
        .unwrap_err()
    };

    assert_eq!(
        build("invalidTimeUnitType", "calendar", true, true, -1, -1).as_config(),
        Some(&ConfigError::InvalidTimeUnit("invalidTimeUnitType".into()))
    );
    assert_eq!(
        build("hour", "invalidDescriptorType", true, true, -1, -1).as_config(),
        Some(&ConfigError::InvalidQuotaType("invalidDescriptorType".into()))
    );
    assert_eq!(
        build("hour", "calendar", false, false, -1, -1).as_config(),
        Some(&ConfigError::AsyncRequiresDistributed)
    );
    assert_eq!(
        build("hour", "calendar", true, false, 10, 10).as_config(),
        Some(&ConfigError::ConflictingSyncSettings {
            sync_time_in_sec: 10,
            sync_message_count: 10,
        })
    );

    let err = QuotaConfig::builder()
        .tenant_id("sampleOrg")
        .quota_id("sampleID")
        .interval(0)
        .time_unit("hour")
        .quota_type("calendar")
        .start_time(start)
        .max_count(10)
        .build()
        .unwrap_err();
    assert_eq!(err, ConfigError::InvalidInterval(0));
}

#[tokio::test]
async fn test_hourly_calendar_end_to_end() {
    let manager = QuotaManager::new(MemoryCounterStore::new());
    let request = QuotaRequest::new(
        QuotaConfig::builder()
            .tenant_id("sampleOrg")
            .quota_id("sampleID")
            .time_unit("hour")
            .quota_type("calendar")
            .start_time((Utc::now() - TimeDelta::days(1)).timestamp())
            .max_count(10)
            .build()
            .unwrap(),
    );

    for i in 1..=10 {
        let result = manager.apply(&request).await.unwrap();
        assert!(result.is_allowed(), "Call {} should be allowed", i);
        assert_eq!(result.current_count, i);
    }

    let result = manager.apply(&request).await.unwrap();
    assert!(result.exceeded, "11th call should be exceeded");
    assert_eq!(result.current_count, 10);
    assert_eq!(result.window_end - result.window_start, 3600);
}
