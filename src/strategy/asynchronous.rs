//! Asynchronous distributed counting.
//!
//! Requests are judged against the bucket's local view of the window and
//! buffered in its [`AsyncState`]. The buffer reaches the counter store on a
//! message threshold (request path) or on the sync ticker (background task).

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::bucket::{AsyncState, QuotaBucket, Window};
use crate::error::{QuotaError, Result};
use crate::result::QuotaBucketResult;
use crate::storage::CounterStore;

fn async_state(bucket: &QuotaBucket) -> Result<&AsyncState> {
    bucket
        .async_state()
        .ok_or_else(|| QuotaError::AsyncStateMissing(bucket.cache_key().to_string()))
}

/// Point the buffer at `window`, reading its count from the store, then
/// write whatever earlier windows still owe.
async fn sync_window<S: CounterStore>(
    bucket: &QuotaBucket,
    state: &AsyncState,
    store: &S,
    window: Window,
) -> Result<()> {
    if !state.is_synced_to(window) {
        let synced = store
            .get_count(bucket.tenant_id(), bucket.quota_id(), window.0, window.1)
            .await?;
        if state.install_window(window, synced) {
            debug!(key = bucket.cache_key(), start = window.0, synced, "hydrated quota window");
        }
    }
    write_owed(bucket, state, store, state.take_superseded()).await
}

/// Write deltas of windows other than the tracked one.
///
/// On failure the unwritten deltas go back into the buffer.
async fn write_owed<S: CounterStore>(
    bucket: &QuotaBucket,
    state: &AsyncState,
    store: &S,
    owed: Vec<(Window, i64)>,
) -> Result<()> {
    let mut owed = owed.into_iter();
    while let Some((window, delta)) = owed.next() {
        let written = store
            .increment_and_get_count(
                bucket.tenant_id(),
                bucket.quota_id(),
                delta,
                window.0,
                window.1,
            )
            .await;
        if let Err(err) = written {
            state.restore_superseded(std::iter::once((window, delta)).chain(owed));
            return Err(err);
        }
        debug!(key = bucket.cache_key(), delta, start = window.0, "flushed superseded window");
    }
    Ok(())
}

pub(super) async fn increment<S: CounterStore>(
    bucket: &QuotaBucket,
    store: &S,
    weight: i64,
    now: DateTime<Utc>,
) -> Result<QuotaBucketResult> {
    let state = async_state(bucket)?;
    let period = bucket.period_at(now)?;
    sync_window(bucket, state, store, (period.start_unix(), period.end_unix())).await?;

    if !period.is_current(now) {
        return Ok(QuotaBucketResult::new(bucket, &period, state.local_count(), false));
    }

    let buffered = state.apply(bucket.max_count(), weight);
    debug!(
        key = bucket.cache_key(),
        weight,
        count = buffered.count,
        exceeded = buffered.exceeded,
        "buffered increment"
    );
    if buffered.flush_due {
        flush(bucket, store).await?;
    }
    Ok(QuotaBucketResult::new(
        bucket,
        &period,
        buffered.count,
        buffered.exceeded,
    ))
}

pub(super) async fn reset_current<S: CounterStore>(
    bucket: &QuotaBucket,
    store: &S,
    now: DateTime<Utc>,
) -> Result<QuotaBucketResult> {
    let state = async_state(bucket)?;
    let period = bucket.period_at(now)?;
    sync_window(bucket, state, store, (period.start_unix(), period.end_unix())).await?;

    let count = state.compensate(bucket.weight());
    Ok(QuotaBucketResult::new(
        bucket,
        &period,
        count,
        count > bucket.max_count(),
    ))
}

pub(super) fn reset_count(bucket: &QuotaBucket) -> Result<()> {
    async_state(bucket)?.clear_pending();
    Ok(())
}

/// Write the pending deltas of `bucket` to the store.
///
/// A failed write puts the delta back into the buffer and returns the error.
pub(crate) async fn flush<S: CounterStore>(bucket: &QuotaBucket, store: &S) -> Result<()> {
    let state = async_state(bucket)?;
    write_owed(bucket, state, store, state.take_superseded()).await?;
    let Some((window, delta)) = state.take_pending() else {
        return Ok(());
    };

    match store
        .increment_and_get_count(bucket.tenant_id(), bucket.quota_id(), delta, window.0, window.1)
        .await
    {
        Ok(count) => {
            state.record_synced(window, count);
            debug!(key = bucket.cache_key(), delta, count, "flushed quota buffer");
            Ok(())
        }
        Err(err) => {
            state.restore_pending(window, delta);
            Err(err)
        }
    }
}

/// Write what an evicted bucket still owes the store.
///
/// A no-op unless the bucket's state was stopped. Unwritten deltas stay in
/// the buffer for another attempt.
pub(crate) async fn flush_evicted<S: CounterStore>(bucket: &QuotaBucket, store: &S) -> Result<()> {
    let state = async_state(bucket)?;
    let owed = state.drain_stopped();
    if owed.is_empty() {
        return Ok(());
    }
    info!(key = bucket.cache_key(), windows = owed.len(), "flushing evicted quota bucket");
    write_owed(bucket, state, store, owed).await
}

/// Spawn the periodic flush task of an asynchronous bucket.
///
/// The task holds a weak reference to the bucket and ends when the bucket
/// is dropped or its state is stopped.
pub(crate) fn start_ticker<S: CounterStore>(
    bucket: &Arc<QuotaBucket>,
    store: Arc<S>,
) -> Result<bool> {
    let Some(state) = bucket.async_state() else {
        return Ok(false);
    };
    let Some(every) = state.flush_interval() else {
        return Ok(false);
    };
    if state.has_ticker() || state.is_stopped() {
        return Ok(false);
    }

    let runtime = Handle::try_current().map_err(|e| {
        QuotaError::Internal(format!(
            "sync ticker for {} needs a tokio runtime: {}",
            bucket.cache_key(),
            e
        ))
    })?;

    let weak = Arc::downgrade(bucket);
    let started = state
        .install_ticker(|shutdown| runtime.spawn(run_ticker(weak, store, every, shutdown)));
    if started {
        info!(key = bucket.cache_key(), every = ?every, "quota sync ticker started");
    }
    Ok(started)
}

async fn run_ticker<S: CounterStore>(
    bucket: Weak<QuotaBucket>,
    store: Arc<S>,
    every: Duration,
    shutdown: Arc<Notify>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(bucket) = bucket.upgrade() else {
                    break;
                };
                if let Err(err) = flush(&bucket, store.as_ref()).await {
                    warn!(key = bucket.cache_key(), error = %err, "quota sync flush failed");
                }
            }
            _ = shutdown.notified() => {
                break;
            }
        }
    }
}
