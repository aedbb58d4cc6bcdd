//! Quota buckets.
//!
//! A [`QuotaBucket`] ties a validated [`QuotaConfig`] to its current window,
//! the weight of the last call, and the per-mode counting state: a local
//! counter for non-distributed buckets, an [`AsyncState`] buffer for
//! asynchronous distributed buckets, nothing extra for synchronous ones.
//!
//! Buckets are shared as `Arc<QuotaBucket>`; every mutable field sits behind
//! its own lock so request tasks and the sync ticker never alias mutable
//! state.

mod async_state;

pub use async_state::AsyncState;
pub(crate) use async_state::Window;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{QuotaError, Result};
use crate::period::{Period, QuotaKind, TimeUnit};
use crate::quota::QuotaConfig;
use crate::result::QuotaBucketResult;
use crate::storage::CounterStore;
use crate::strategy::BucketMode;

/// Mutable per-call state.
#[derive(Debug)]
struct BucketState {
    period: Period,
    weight: i64,
}

/// In-process counter of a non-distributed bucket.
#[derive(Debug, Default)]
pub(crate) struct LocalCounter {
    window: Option<Window>,
    count: i64,
}

impl LocalCounter {
    /// Run `f` on the count of `window`, starting from zero on a new window.
    pub(crate) fn with_window<R>(&mut self, window: Window, f: impl FnOnce(&mut i64) -> R) -> R {
        if self.window != Some(window) {
            self.window = Some(window);
            self.count = 0;
        }
        f(&mut self.count)
    }

    pub(crate) fn reset(&mut self) {
        self.count = 0;
    }
}

/// A quota bucket.
pub struct QuotaBucket {
    config: QuotaConfig,
    cache_key: String,
    time_unit: TimeUnit,
    kind: QuotaKind,
    mode: BucketMode,
    start: DateTime<Utc>,
    state: Mutex<BucketState>,
    local: Option<Mutex<LocalCounter>>,
    async_state: Option<AsyncState>,
}

impl std::fmt::Debug for QuotaBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaBucket")
            .field("key", &self.cache_key)
            .field("mode", &self.mode)
            .field("kind", &self.kind)
            .field("time_unit", &self.time_unit)
            .field("interval", &self.config.interval)
            .field("max_count", &self.config.max_count)
            .finish()
    }
}

impl QuotaBucket {
    /// Build a bucket from primitive configuration values.
    ///
    /// Sync settings of zero or less are treated as unset. Fails on any
    /// invalid configuration, see [`QuotaConfig::validate`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: impl Into<String>,
        quota_id: impl Into<String>,
        interval: u32,
        time_unit: &str,
        quota_type: &str,
        precise_at_seconds_level: bool,
        start_time: i64,
        max_count: i64,
        weight: i64,
        distributed: bool,
        synchronous: bool,
        sync_time_in_sec: i64,
        sync_message_count: i64,
    ) -> Result<Self> {
        Self::from_config(QuotaConfig {
            tenant_id: tenant_id.into(),
            quota_id: quota_id.into(),
            interval,
            time_unit: time_unit.to_string(),
            quota_type: quota_type.to_string(),
            precise_at_seconds_level,
            start_time,
            max_count,
            weight,
            distributed,
            synchronous,
            sync_time_in_sec,
            sync_message_count,
        })
    }

    /// Build a bucket from a config, deriving the initial period from now.
    pub fn from_config(config: QuotaConfig) -> Result<Self> {
        Self::from_config_at(config, Utc::now())
    }

    /// Build a bucket from a config, deriving the initial period from `now`.
    pub fn from_config_at(config: QuotaConfig, now: DateTime<Utc>) -> Result<Self> {
        config.validate()?;
        let time_unit = config.time_unit()?;
        let kind = config.kind()?;
        let mode = config.mode()?;
        let start = config.start_instant()?;

        let period = kind.initial_period(
            time_unit,
            config.interval,
            config.precise_at_seconds_level,
            start,
            now,
        )?;

        let local = matches!(mode, BucketMode::NonDistributed)
            .then(|| Mutex::new(LocalCounter::default()));
        let async_state = matches!(mode, BucketMode::Asynchronous).then(|| {
            AsyncState::new(config.sync_interval(), config.sync_message_threshold())
        });

        Ok(Self {
            cache_key: config.cache_key(),
            state: Mutex::new(BucketState {
                period,
                weight: config.weight,
            }),
            config,
            time_unit,
            kind,
            mode,
            start,
            local,
            async_state,
        })
    }

    /// Re-check the configuration invariants and the per-mode state.
    pub fn validate(&self) -> Result<()> {
        self.config.validate()?;
        if matches!(self.mode, BucketMode::Asynchronous) && self.async_state.is_none() {
            return Err(QuotaError::AsyncStateMissing(self.cache_key.clone()));
        }
        Ok(())
    }

    /// Configuration the bucket was built from.
    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    /// Tenant the quota belongs to.
    pub fn tenant_id(&self) -> &str {
        &self.config.tenant_id
    }

    /// Quota identifier.
    pub fn quota_id(&self) -> &str {
        &self.config.quota_id
    }

    /// Key of this bucket in the bucket cache.
    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    /// Maximum weighted count per window.
    pub fn max_count(&self) -> i64 {
        self.config.max_count
    }

    /// Number of time units per window.
    pub fn interval(&self) -> u32 {
        self.config.interval
    }

    /// Window granularity.
    pub fn time_unit(&self) -> TimeUnit {
        self.time_unit
    }

    /// Window layout.
    pub fn kind(&self) -> QuotaKind {
        self.kind
    }

    /// Counting mode.
    pub fn mode(&self) -> BucketMode {
        self.mode
    }

    /// Configured input start time.
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start
    }

    /// Whether counts are shared through the counter store.
    pub fn is_distributed(&self) -> bool {
        self.config.distributed
    }

    /// Whether increments are committed before returning.
    pub fn is_synchronous(&self) -> bool {
        self.config.synchronous
    }

    /// Weight of the last call.
    pub fn weight(&self) -> i64 {
        self.state.lock().weight
    }

    /// Override the weight for subsequent calls.
    pub fn set_weight(&self, weight: i64) {
        self.state.lock().weight = weight;
    }

    /// Async state, present only for asynchronous distributed buckets.
    pub fn async_state(&self) -> Option<&AsyncState> {
        self.async_state.as_ref()
    }

    pub(crate) fn local_counter(&self) -> Option<&Mutex<LocalCounter>> {
        self.local.as_ref()
    }

    /// Current period, recomputed if the cached one has elapsed.
    pub fn period(&self) -> Result<Period> {
        self.period_at(Utc::now())
    }

    /// Period as of `now`, recomputed if the cached one has elapsed.
    pub fn period_at(&self, now: DateTime<Utc>) -> Result<Period> {
        let mut state = self.state.lock();
        if state.period.has_elapsed(now) {
            let next = self.kind.next_period(
                self.time_unit,
                self.config.interval,
                self.config.precise_at_seconds_level,
                self.start,
                now,
            )?;
            debug!(
                key = %self.cache_key,
                start = %next.start_time(),
                end = %next.end_time(),
                "quota period rolled forward"
            );
            state.period = next;
        }
        Ok(state.period)
    }

    /// Check whether `now` falls in the bucket's current period.
    pub fn is_current_period(&self, now: DateTime<Utc>) -> Result<bool> {
        Ok(self.period_at(now)?.is_current(now))
    }

    /// Charge `weight` against the quota.
    pub async fn increment_quota_count<S: CounterStore>(
        &self,
        store: &S,
        weight: i64,
    ) -> Result<QuotaBucketResult> {
        self.mode.increment_quota_count(self, store, weight).await
    }

    /// Undo this bucket's last charge in the current window.
    pub async fn reset_quota_for_current_period<S: CounterStore>(
        &self,
        store: &S,
    ) -> Result<QuotaBucketResult> {
        self.mode.reset_quota_for_current_period(self, store).await
    }

    /// Discard locally held counts.
    pub fn reset_count(&self) -> Result<()> {
        self.mode.reset_count(self)
    }

    /// Write buffered counts to the store. A no-op unless asynchronous.
    pub async fn flush<S: CounterStore>(&self, store: &S) -> Result<()> {
        if self.async_state.is_none() {
            return Ok(());
        }
        crate::strategy::asynchronous::flush(self, store).await
    }

    /// Write what this bucket still owed the store when it was evicted.
    ///
    /// A no-op unless the bucket is asynchronous and was evicted from its
    /// cache. Failed writes stay buffered, so the call can be repeated.
    pub async fn flush_evicted<S: CounterStore>(&self, store: &S) -> Result<()> {
        if self.async_state.is_none() {
            return Ok(());
        }
        crate::strategy::asynchronous::flush_evicted(self, store).await
    }

    /// Start the periodic flush task of an asynchronous bucket.
    ///
    /// Returns `false` when no ticker is needed or one is already running.
    pub fn start_sync_ticker<S: CounterStore>(
        self: &Arc<Self>,
        store: Arc<S>,
    ) -> Result<bool> {
        crate::strategy::asynchronous::start_ticker(self, store)
    }

    #[cfg(test)]
    pub(crate) fn without_async_state(mut self) -> Self {
        self.async_state = None;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use chrono::{TimeDelta, TimeZone};

    fn hourly(kind: &str, start_time: i64) -> QuotaBucket {
        QuotaBucket::new(
            "sampleOrg", "sampleID", 1, "hour", kind, true, start_time, 10, 1, true, true, -1, -1,
        )
        .unwrap()
    }

    #[test]
    fn test_new_sets_fields() {
        let start = Utc::now() - TimeDelta::days(31);
        let bucket = hourly("calendar", start.timestamp());

        assert_eq!(bucket.tenant_id(), "sampleOrg");
        assert_eq!(bucket.quota_id(), "sampleID");
        assert_eq!(bucket.cache_key(), "sampleOrg~sampleID");
        assert_eq!(bucket.mode(), BucketMode::Synchronous);
        assert!(bucket.is_distributed());
        assert!(bucket.is_synchronous());
        assert!(bucket.async_state().is_none());
        assert!(bucket.local_counter().is_none());
        assert_eq!(bucket.weight(), 1);
        bucket.validate().unwrap();
    }

    #[test]
    fn test_calendar_hour_is_current_hour() {
        let now = Utc.with_ymd_and_hms(2024, 5, 17, 13, 42, 7).unwrap();
        let config = hourly("calendar", 0).config().clone();
        let config = QuotaConfig {
            start_time: (now - TimeDelta::days(30)).timestamp(),
            ..config
        };
        let bucket = QuotaBucket::from_config_at(config, now).unwrap();

        let period = bucket.period_at(now).unwrap();
        assert_eq!(period.start_time(), Utc.with_ymd_and_hms(2024, 5, 17, 13, 0, 0).unwrap());
        assert_eq!(period.end_time(), Utc.with_ymd_and_hms(2024, 5, 17, 14, 0, 0).unwrap());
        assert!(bucket.is_current_period(now).unwrap());
    }

    #[test]
    fn test_period_is_idempotent_within_window() {
        let now = Utc.with_ymd_and_hms(2024, 5, 17, 13, 42, 7).unwrap();
        let config = QuotaConfig {
            start_time: now.timestamp(),
            ..hourly("rollingwindow", 0).config().clone()
        };
        let bucket = QuotaBucket::from_config_at(config, now).unwrap();

        let first = bucket.period_at(now + TimeDelta::minutes(5)).unwrap();
        let second = bucket.period_at(now + TimeDelta::minutes(50)).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.start_time(), now);
    }

    #[test]
    fn test_period_rolls_after_window() {
        let now = Utc.with_ymd_and_hms(2024, 5, 17, 13, 42, 7).unwrap();
        let config = QuotaConfig {
            start_time: now.timestamp(),
            ..hourly("calendar", 0).config().clone()
        };
        let bucket = QuotaBucket::from_config_at(config, now).unwrap();

        let later = now + TimeDelta::hours(3);
        let period = bucket.period_at(later).unwrap();
        assert_eq!(period.start_time(), Utc.with_ymd_and_hms(2024, 5, 17, 16, 0, 0).unwrap());
        assert_eq!(period.input_start_time(), now);
    }

    #[test]
    fn test_weight_override() {
        let bucket = hourly("calendar", Utc::now().timestamp());
        bucket.set_weight(7);
        assert_eq!(bucket.weight(), 7);
    }

    #[test]
    fn test_mode_specific_state() {
        let start = Utc::now().timestamp();
        let build = |distributed, synchronous, sync_time_in_sec| {
            QuotaBucket::new(
                "o", "q", 1, "minute", "calendar", true, start, 5, 1, distributed, synchronous,
                sync_time_in_sec, -1,
            )
        };
        let local = build(false, true, -1).unwrap();
        assert_eq!(local.mode(), BucketMode::NonDistributed);
        assert!(local.local_counter().is_some());

        let buffered = build(true, false, 10).unwrap();
        assert_eq!(buffered.mode(), BucketMode::Asynchronous);
        assert!(buffered.async_state().is_some());

        let broken = buffered.without_async_state();
        assert!(matches!(
            broken.validate(),
            Err(crate::error::QuotaError::AsyncStateMissing(_))
        ));
    }

    #[test]
    fn test_construction_rejects_bad_config() {
        let start = Utc::now().timestamp();
        let build = |unit: &str, kind: &str, distributed, synchronous, sync_time, sync_count| {
            QuotaBucket::new(
                "o", "q", 1, unit, kind, true, start, 5, 1, distributed, synchronous, sync_time,
                sync_count,
            )
            .unwrap_err()
        };

        let err = build("invalidTimeUnit", "calendar", true, true, -1, -1);
        assert_eq!(
            err.as_config(),
            Some(&ConfigError::InvalidTimeUnit("invalidTimeUnit".into()))
        );

        let err = build("hour", "invalidQuotaType", true, true, -1, -1);
        assert_eq!(
            err.as_config(),
            Some(&ConfigError::InvalidQuotaType("invalidQuotaType".into()))
        );

        let err = build("hour", "calendar", true, false, 10, 10);
        assert!(matches!(
            err.as_config(),
            Some(ConfigError::ConflictingSyncSettings { .. })
        ));

        let err = build("hour", "calendar", false, false, -1, -1);
        assert_eq!(err.as_config(), Some(&ConfigError::AsyncRequiresDistributed));
    }
}
