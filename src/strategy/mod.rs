//! Counting modes of a quota bucket.
//!
//! Every bucket counts in exactly one [`BucketMode`], derived from its
//! `distributed` and `synchronous` flags:
//!
//! | distributed | synchronous | mode |
//! |-------------|-------------|------|
//! | yes | yes | [`BucketMode::Synchronous`]: every increment hits the store |
//! | yes | no | [`BucketMode::Asynchronous`]: increments are buffered and flushed |
//! | no | yes | [`BucketMode::NonDistributed`]: counts stay in the process |
//!
//! All three judge a request with the same admission rule, see [`admit`].

pub(crate) mod asynchronous;
mod non_distributed;
mod synchronous;

use std::fmt;
use std::str::FromStr;

use chrono::Utc;

use crate::bucket::QuotaBucket;
use crate::error::{ConfigError, Result};
use crate::result::QuotaBucketResult;
use crate::storage::CounterStore;

/// Counting mode of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketMode {
    /// Distributed, committed to the counter store on every call.
    Synchronous,
    /// Distributed, buffered locally and flushed periodically.
    Asynchronous,
    /// Counted in this process only.
    NonDistributed,
}

impl BucketMode {
    /// All modes.
    pub const ALL: [BucketMode; 3] = [
        BucketMode::Synchronous,
        BucketMode::Asynchronous,
        BucketMode::NonDistributed,
    ];

    /// Derive the mode from the bucket flags.
    pub fn for_flags(
        distributed: bool,
        synchronous: bool,
    ) -> std::result::Result<Self, ConfigError> {
        match (distributed, synchronous) {
            (true, true) => Ok(Self::Synchronous),
            (true, false) => Ok(Self::Asynchronous),
            (false, true) => Ok(Self::NonDistributed),
            (false, false) => Err(ConfigError::AsyncRequiresDistributed),
        }
    }

    /// Get the mode name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Synchronous => "synchronous",
            Self::Asynchronous => "asynchronous",
            Self::NonDistributed => "nondistributed",
        }
    }

    /// Charge `weight` against the bucket's current window.
    ///
    /// The weight becomes the bucket's weight for a later
    /// [`reset_quota_for_current_period`](Self::reset_quota_for_current_period).
    pub async fn increment_quota_count<S: CounterStore>(
        &self,
        bucket: &QuotaBucket,
        store: &S,
        weight: i64,
    ) -> Result<QuotaBucketResult> {
        bucket.set_weight(weight);
        let now = Utc::now();
        match self {
            Self::Synchronous => synchronous::increment(bucket, store, weight, now).await,
            Self::Asynchronous => asynchronous::increment(bucket, store, weight, now).await,
            Self::NonDistributed => non_distributed::increment(bucket, weight, now),
        }
    }

    /// Take the bucket's weight back out of the current window.
    pub async fn reset_quota_for_current_period<S: CounterStore>(
        &self,
        bucket: &QuotaBucket,
        store: &S,
    ) -> Result<QuotaBucketResult> {
        let now = Utc::now();
        match self {
            Self::Synchronous => synchronous::reset_current(bucket, store, now).await,
            Self::Asynchronous => asynchronous::reset_current(bucket, store, now).await,
            Self::NonDistributed => non_distributed::reset_current(bucket, now),
        }
    }

    /// Discard counts held in the process.
    pub fn reset_count(&self, bucket: &QuotaBucket) -> Result<()> {
        match self {
            Self::Synchronous => Ok(()),
            Self::Asynchronous => asynchronous::reset_count(bucket),
            Self::NonDistributed => non_distributed::reset_count(bucket),
        }
    }
}

impl FromStr for BucketMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "synchronous" => Ok(Self::Synchronous),
            "asynchronous" => Ok(Self::Asynchronous),
            "nondistributed" | "non-distributed" => Ok(Self::NonDistributed),
            _ => Err(ConfigError::UnrecognizedBucketType(s.to_string())),
        }
    }
}

impl fmt::Display for BucketMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Decision on one increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Charge the weight.
    Admit,
    /// Leave the count alone and report `count`.
    Reject { count: i64, exceeded: bool },
}

/// Judge an increment of `weight` against a window holding `current`.
///
/// A request may fill the window exactly to `max_count`. Zero-weight
/// requests are admitted while the window is below its maximum and never
/// mutate the count.
pub(crate) fn admit(current: i64, max_count: i64, weight: i64) -> Admission {
    if current >= max_count {
        Admission::Reject {
            count: current,
            exceeded: true,
        }
    } else if max_count - current >= weight {
        Admission::Admit
    } else {
        Admission::Reject {
            count: current + weight,
            exceeded: weight != 0,
        }
    }
}
