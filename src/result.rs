//! Outcome of an increment or reset call.
//!
//! A `QuotaBucketResult` reports whether the call exceeded the quota, the
//! count it was judged against, and the window it was counted in. The request
//! layer turns it into whatever its own callers expect.

use serde::{Deserialize, Serialize};

use crate::bucket::QuotaBucket;
use crate::period::Period;

/// The result of an increment or reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaBucketResult {
    /// Tenant the quota belongs to.
    pub tenant_id: String,
    /// Quota identifier.
    pub quota_id: String,
    /// Maximum weighted count per window.
    pub max_count: i64,
    /// Count after the call, or the projected count when it was rejected.
    pub current_count: i64,
    /// Whether the call exceeded the quota.
    pub exceeded: bool,
    /// Window start in Unix seconds.
    pub window_start: i64,
    /// Window end in Unix seconds.
    pub window_end: i64,
}

impl QuotaBucketResult {
    pub(crate) fn new(bucket: &QuotaBucket, period: &Period, count: i64, exceeded: bool) -> Self {
        Self {
            tenant_id: bucket.tenant_id().to_string(),
            quota_id: bucket.quota_id().to_string(),
            max_count: bucket.max_count(),
            current_count: count,
            exceeded,
            window_start: period.start_unix(),
            window_end: period.end_unix(),
        }
    }

    /// Check if the call stayed within the quota.
    pub fn is_allowed(&self) -> bool {
        !self.exceeded
    }

    /// Remaining weighted count in the window.
    pub fn remaining(&self) -> i64 {
        (self.max_count - self.current_count).max(0)
    }
}
