//! Quota configuration for a tenant/quota pair.
//!
//! A `QuotaConfig` carries everything needed to build a quota bucket: who the
//! quota belongs to, how its windows are laid out, how many weighted calls a
//! window allows, and how counts are synchronized with the counter store.
//!
//! Kind and time unit are kept as the strings they were configured with, so a
//! deserialized config can still be checked with [`QuotaConfig::validate`].
//!
//! # Examples
//!
//! ```ignore
//! use quota_bucket::QuotaConfig;
//!
//! // 1000 calls per calendar hour, counted synchronously
//! let config = QuotaConfig::builder()
//!     .tenant_id("acme")
//!     .quota_id("search")
//!     .interval(1)
//!     .time_unit("hour")
//!     .quota_type("calendar")
//!     .start_time(1_700_000_000)
//!     .max_count(1000)
//!     .build()?;
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::period::{QuotaKind, TimeUnit};
use crate::strategy::BucketMode;

/// Delimiter between tenant and quota id in cache keys.
pub const CACHE_KEY_DELIMITER: &str = "~";

/// Sentinel for an unset sync setting.
pub const SYNC_UNSET: i64 = -1;

fn sync_unset() -> i64 {
    SYNC_UNSET
}

fn default_true() -> bool {
    true
}

fn default_weight() -> i64 {
    1
}

/// Quota configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaConfig {
    /// Tenant (organization) the quota belongs to.
    pub tenant_id: String,

    /// Quota identifier, unique within the tenant.
    pub quota_id: String,

    /// Number of time units per window.
    pub interval: u32,

    /// Window granularity (`second` .. `month`).
    pub time_unit: String,

    /// Window layout (`calendar` or `rollingwindow`).
    pub quota_type: String,

    /// Truncate window boundaries to whole seconds.
    #[serde(default = "default_true")]
    pub precise_at_seconds_level: bool,

    /// Input start time in Unix seconds.
    pub start_time: i64,

    /// Maximum weighted count per window.
    pub max_count: i64,

    /// Cost of one request.
    #[serde(default = "default_weight")]
    pub weight: i64,

    /// Counts are shared through the counter store.
    #[serde(default = "default_true")]
    pub distributed: bool,

    /// Every increment is committed to the counter store before returning.
    #[serde(default = "default_true")]
    pub synchronous: bool,

    /// Flush interval in seconds for asynchronous buckets (`<= 0` is unset).
    #[serde(default = "sync_unset")]
    pub sync_time_in_sec: i64,

    /// Flush after this many buffered increments (`<= 0` is unset).
    #[serde(default = "sync_unset")]
    pub sync_message_count: i64,
}

impl QuotaConfig {
    /// Create a new quota config builder.
    pub fn builder() -> QuotaConfigBuilder {
        QuotaConfigBuilder::new()
    }

    /// Key under which buckets for this config are cached.
    pub fn cache_key(&self) -> String {
        cache_key(&self.tenant_id, &self.quota_id)
    }

    /// Parse the configured time unit.
    pub fn time_unit(&self) -> Result<TimeUnit, ConfigError> {
        self.time_unit.parse()
    }

    /// Parse the configured quota kind.
    pub fn kind(&self) -> Result<QuotaKind, ConfigError> {
        self.quota_type.parse()
    }

    /// Derive the counting mode from the distributed/synchronous flags.
    pub fn mode(&self) -> Result<BucketMode, ConfigError> {
        BucketMode::for_flags(self.distributed, self.synchronous)
    }

    /// Input start time as a UTC instant.
    pub fn start_instant(&self) -> Result<DateTime<Utc>, ConfigError> {
        DateTime::<Utc>::from_timestamp(self.start_time, 0)
            .ok_or(ConfigError::InvalidStartTime(self.start_time))
    }

    /// Configured flush interval, if any.
    pub fn sync_interval(&self) -> Option<Duration> {
        u64::try_from(self.sync_time_in_sec)
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Configured flush threshold, if any.
    pub fn sync_message_threshold(&self) -> Option<u64> {
        u64::try_from(self.sync_message_count)
            .ok()
            .filter(|count| *count > 0)
    }

    /// Check every configuration invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval == 0 {
            return Err(ConfigError::InvalidInterval(self.interval));
        }
        self.time_unit()?;
        self.kind()?;
        self.start_instant()?;
        if self.sync_interval().is_some() && self.sync_message_threshold().is_some() {
            return Err(ConfigError::ConflictingSyncSettings {
                sync_time_in_sec: self.sync_time_in_sec,
                sync_message_count: self.sync_message_count,
            });
        }
        self.mode()?;
        Ok(())
    }
}

/// Build the cache key for a tenant/quota pair.
pub fn cache_key(tenant_id: &str, quota_id: &str) -> String {
    format!("{}{}{}", tenant_id, CACHE_KEY_DELIMITER, quota_id)
}

/// Builder for creating quota configs with validation.
#[derive(Debug)]
pub struct QuotaConfigBuilder {
    tenant_id: Option<String>,
    quota_id: Option<String>,
    interval: u32,
    time_unit: Option<String>,
    quota_type: Option<String>,
    precise: bool,
    start_time: Option<i64>,
    max_count: Option<i64>,
    weight: i64,
    distributed: bool,
    synchronous: bool,
    sync_time_in_sec: i64,
    sync_message_count: i64,
}

impl Default for QuotaConfigBuilder {
    fn default() -> Self {
        Self {
            tenant_id: None,
            quota_id: None,
            interval: 1,
            time_unit: None,
            quota_type: None,
            precise: true,
            start_time: None,
            max_count: None,
            weight: 1,
            distributed: true,
            synchronous: true,
            sync_time_in_sec: SYNC_UNSET,
            sync_message_count: SYNC_UNSET,
        }
    }
}

impl QuotaConfigBuilder {
    /// Create a new quota config builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the tenant id.
    pub fn tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Set the quota id.
    pub fn quota_id(mut self, quota_id: impl Into<String>) -> Self {
        self.quota_id = Some(quota_id.into());
        self
    }

    /// Set the number of time units per window (default 1).
    pub fn interval(mut self, interval: u32) -> Self {
        self.interval = interval;
        self
    }

    /// Set the time unit.
    pub fn time_unit(mut self, unit: impl Into<String>) -> Self {
        self.time_unit = Some(unit.into());
        self
    }

    /// Set the quota kind.
    pub fn quota_type(mut self, kind: impl Into<String>) -> Self {
        self.quota_type = Some(kind.into());
        self
    }

    /// Truncate boundaries to whole seconds (default true).
    pub fn precise_at_seconds_level(mut self, precise: bool) -> Self {
        self.precise = precise;
        self
    }

    /// Set the input start time in Unix seconds.
    pub fn start_time(mut self, start_time: i64) -> Self {
        self.start_time = Some(start_time);
        self
    }

    /// Set the maximum weighted count per window.
    pub fn max_count(mut self, max_count: i64) -> Self {
        self.max_count = Some(max_count);
        self
    }

    /// Set the request weight (default 1).
    pub fn weight(mut self, weight: i64) -> Self {
        self.weight = weight;
        self
    }

    /// Share counts through the counter store (default true).
    pub fn distributed(mut self, distributed: bool) -> Self {
        self.distributed = distributed;
        self
    }

    /// Commit every increment before returning (default true).
    pub fn synchronous(mut self, synchronous: bool) -> Self {
        self.synchronous = synchronous;
        self
    }

    /// Flush asynchronous buckets every `secs` seconds.
    pub fn sync_time_in_sec(mut self, secs: i64) -> Self {
        self.sync_time_in_sec = secs;
        self
    }

    /// Flush asynchronous buckets after `count` buffered increments.
    pub fn sync_message_count(mut self, count: i64) -> Self {
        self.sync_message_count = count;
        self
    }

    /// Build the config, returning an error if invalid.
    pub fn build(self) -> Result<QuotaConfig, ConfigError> {
        let tenant_id = self
            .tenant_id
            .ok_or_else(|| ConfigError::MissingRequired("tenant_id".into()))?;
        let quota_id = self
            .quota_id
            .ok_or_else(|| ConfigError::MissingRequired("quota_id".into()))?;
        let time_unit = self
            .time_unit
            .ok_or_else(|| ConfigError::MissingRequired("time_unit".into()))?;
        let quota_type = self
            .quota_type
            .ok_or_else(|| ConfigError::MissingRequired("quota_type".into()))?;
        let start_time = self
            .start_time
            .ok_or_else(|| ConfigError::MissingRequired("start_time".into()))?;
        let max_count = self
            .max_count
            .ok_or_else(|| ConfigError::MissingRequired("max_count".into()))?;

        let config = QuotaConfig {
            tenant_id,
            quota_id,
            interval: self.interval,
            time_unit,
            quota_type,
            precise_at_seconds_level: self.precise,
            start_time,
            max_count,
            weight: self.weight,
            distributed: self.distributed,
            synchronous: self.synchronous,
            sync_time_in_sec: self.sync_time_in_sec,
            sync_message_count: self.sync_message_count,
        };
        config.validate()?;
        Ok(config)
    }
}
