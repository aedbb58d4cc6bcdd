//! Synchronous distributed counting.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::bucket::QuotaBucket;
use crate::error::Result;
use crate::result::QuotaBucketResult;
use crate::storage::CounterStore;
use crate::strategy::{Admission, admit};

pub(super) async fn increment<S: CounterStore>(
    bucket: &QuotaBucket,
    store: &S,
    weight: i64,
    now: DateTime<Utc>,
) -> Result<QuotaBucketResult> {
    let period = bucket.period_at(now)?;
    let (start, end) = (period.start_unix(), period.end_unix());
    let current = store
        .get_count(bucket.tenant_id(), bucket.quota_id(), start, end)
        .await?;

    if !period.is_current(now) {
        debug!(key = bucket.cache_key(), current, "period not current, skipping increment");
        return Ok(QuotaBucketResult::new(bucket, &period, current, false));
    }

    let result = match admit(current, bucket.max_count(), weight) {
        Admission::Admit if weight == 0 => QuotaBucketResult::new(bucket, &period, current, false),
        Admission::Admit => {
            let count = store
                .increment_and_get_count(bucket.tenant_id(), bucket.quota_id(), weight, start, end)
                .await?;
            QuotaBucketResult::new(bucket, &period, count, false)
        }
        Admission::Reject { count, exceeded } => {
            QuotaBucketResult::new(bucket, &period, count, exceeded)
        }
    };

    debug!(
        key = bucket.cache_key(),
        weight,
        count = result.current_count,
        exceeded = result.exceeded,
        "synchronous increment"
    );
    Ok(result)
}

pub(super) async fn reset_current<S: CounterStore>(
    bucket: &QuotaBucket,
    store: &S,
    now: DateTime<Utc>,
) -> Result<QuotaBucketResult> {
    let period = bucket.period_at(now)?;
    let count = store
        .increment_and_get_count(
            bucket.tenant_id(),
            bucket.quota_id(),
            -bucket.weight(),
            period.start_unix(),
            period.end_unix(),
        )
        .await?;
    Ok(QuotaBucketResult::new(
        bucket,
        &period,
        count,
        count > bucket.max_count(),
    ))
}
