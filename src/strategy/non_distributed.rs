//! Counting in the local process only.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::bucket::{LocalCounter, QuotaBucket};
use crate::error::{QuotaError, Result};
use crate::result::QuotaBucketResult;
use crate::strategy::{Admission, admit};

fn counter(bucket: &QuotaBucket) -> Result<&parking_lot::Mutex<LocalCounter>> {
    bucket.local_counter().ok_or_else(|| {
        QuotaError::Internal(format!("local counter missing for {}", bucket.cache_key()))
    })
}

pub(super) fn increment(
    bucket: &QuotaBucket,
    weight: i64,
    now: DateTime<Utc>,
) -> Result<QuotaBucketResult> {
    let period = bucket.period_at(now)?;
    let window = (period.start_unix(), period.end_unix());
    let max_count = bucket.max_count();

    let (count, exceeded) = counter(bucket)?.lock().with_window(window, |count| {
        if !period.is_current(now) {
            return (*count, false);
        }
        match admit(*count, max_count, weight) {
            Admission::Admit => {
                *count += weight;
                (*count, false)
            }
            Admission::Reject { count, exceeded } => (count, exceeded),
        }
    });

    debug!(key = bucket.cache_key(), weight, count, exceeded, "local increment");
    Ok(QuotaBucketResult::new(bucket, &period, count, exceeded))
}

pub(super) fn reset_current(bucket: &QuotaBucket, now: DateTime<Utc>) -> Result<QuotaBucketResult> {
    let period = bucket.period_at(now)?;
    let window = (period.start_unix(), period.end_unix());
    let weight = bucket.weight();

    let count = counter(bucket)?.lock().with_window(window, |count| {
        *count -= weight;
        *count
    });
    Ok(QuotaBucketResult::new(
        bucket,
        &period,
        count,
        count > bucket.max_count(),
    ))
}

pub(super) fn reset_count(bucket: &QuotaBucket) -> Result<()> {
    counter(bucket)?.lock().reset();
    Ok(())
}
