//! Local buffer and sync ticker of an asynchronous distributed bucket.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::strategy::{Admission, admit};

/// Flush interval used when neither a sync interval nor a message threshold
/// is configured.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5);

/// Window bounds as unix seconds.
pub(crate) type Window = (i64, i64);

/// Buffered counts of one window.
#[derive(Debug, Default)]
struct AsyncBuffer {
    window: Option<Window>,
    /// Store count as of the last hydrate or flush.
    synced: i64,
    /// Local delta not yet written to the store.
    pending: i64,
    /// Delta taken by a flush that has not completed.
    in_flight: i64,
    pending_messages: u64,
    /// Unwritten deltas of windows the buffer has moved past.
    superseded: Vec<(Window, i64)>,
    stopped: bool,
}

impl AsyncBuffer {
    fn local_count(&self) -> i64 {
        self.synced + self.in_flight + self.pending
    }

    fn carry(&mut self, window: Window, delta: i64) {
        if delta == 0 {
            return;
        }
        match self.superseded.iter_mut().find(|(owed, _)| *owed == window) {
            Some((_, owed)) => *owed += delta,
            None => self.superseded.push((window, delta)),
        }
    }
}

/// Outcome of a buffered increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Buffered {
    pub count: i64,
    pub exceeded: bool,
    pub flush_due: bool,
}

/// A running sync ticker.
#[derive(Debug)]
struct Ticker {
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

impl Ticker {
    fn stop(self) {
        // notify_one keeps a permit if the task is mid-flush.
        self.shutdown.notify_one();
        self.handle.abort();
    }
}

/// Async counting state owned by one bucket.
///
/// The buffer has its own lock, independent of the bucket cache, and is
/// never held across an `.await`.
#[derive(Debug)]
pub struct AsyncState {
    buffer: Mutex<AsyncBuffer>,
    ticker: Mutex<Option<Ticker>>,
    sync_interval: Option<Duration>,
    sync_message_threshold: Option<u64>,
    ticker_stops: AtomicUsize,
}

impl AsyncState {
    pub(crate) fn new(
        sync_interval: Option<Duration>,
        sync_message_threshold: Option<u64>,
    ) -> Self {
        Self {
            buffer: Mutex::new(AsyncBuffer::default()),
            ticker: Mutex::new(None),
            sync_interval,
            sync_message_threshold,
            ticker_stops: AtomicUsize::new(0),
        }
    }

    /// Interval of the sync ticker, or `None` when flushing on a message
    /// threshold instead.
    pub fn flush_interval(&self) -> Option<Duration> {
        match (self.sync_interval, self.sync_message_threshold) {
            (Some(interval), _) => Some(interval),
            (None, Some(_)) => None,
            (None, None) => Some(DEFAULT_SYNC_INTERVAL),
        }
    }

    /// Number of buffered increments that triggers a flush.
    pub fn sync_message_threshold(&self) -> Option<u64> {
        self.sync_message_threshold
    }

    /// Count as seen locally: last synced store count plus unflushed deltas.
    pub fn local_count(&self) -> i64 {
        self.buffer.lock().local_count()
    }

    /// Delta of the current window waiting for the next flush.
    pub fn pending(&self) -> i64 {
        self.buffer.lock().pending
    }

    /// Every delta not yet written to the store, superseded windows included.
    pub fn unflushed(&self) -> i64 {
        let buffer = self.buffer.lock();
        buffer.pending + buffer.superseded.iter().map(|(_, delta)| delta).sum::<i64>()
    }

    /// Whether the buffer tracks `window` or a later one.
    pub(crate) fn is_synced_to(&self, window: Window) -> bool {
        self.buffer
            .lock()
            .window
            .is_some_and(|current| current.0 >= window.0)
    }

    /// Switch the buffer to `window` with a freshly read store count.
    ///
    /// The delta of the previous window is kept for a later flush. The
    /// buffer never moves back to an earlier window; returns whether
    /// `window` was installed.
    pub(crate) fn install_window(&self, window: Window, synced: i64) -> bool {
        let mut buffer = self.buffer.lock();
        if let Some(current) = buffer.window {
            if current.0 >= window.0 {
                return false;
            }
            let delta = std::mem::take(&mut buffer.pending);
            buffer.carry(current, delta);
        }
        buffer.window = Some(window);
        buffer.synced = synced;
        buffer.in_flight = 0;
        buffer.pending_messages = 0;
        true
    }

    /// Decide on and buffer an increment of `weight` in the tracked window.
    pub(crate) fn apply(&self, max_count: i64, weight: i64) -> Buffered {
        let mut buffer = self.buffer.lock();
        let current = buffer.local_count();
        match admit(current, max_count, weight) {
            Admission::Admit => {
                buffer.pending += weight;
                if weight != 0 {
                    buffer.pending_messages += 1;
                }
                let flush_due = self
                    .sync_message_threshold
                    .is_some_and(|threshold| buffer.pending_messages >= threshold);
                Buffered {
                    count: current + weight,
                    exceeded: false,
                    flush_due,
                }
            }
            Admission::Reject { count, exceeded } => Buffered {
                count,
                exceeded,
                flush_due: false,
            },
        }
    }

    /// Buffer a compensating delta of `-weight` and return the local count.
    pub(crate) fn compensate(&self, weight: i64) -> i64 {
        let mut buffer = self.buffer.lock();
        buffer.pending -= weight;
        buffer.local_count()
    }

    /// Take the pending delta for a flush.
    ///
    /// Returns `None` once the state is stopped, while another flush is in
    /// flight, or when nothing is pending.
    pub(crate) fn take_pending(&self) -> Option<(Window, i64)> {
        let mut buffer = self.buffer.lock();
        if buffer.stopped || buffer.in_flight != 0 || buffer.pending == 0 {
            return None;
        }
        let window = buffer.window?;
        let delta = std::mem::take(&mut buffer.pending);
        buffer.in_flight = delta;
        buffer.pending_messages = 0;
        Some((window, delta))
    }

    /// Take the deltas of superseded windows. Empty once stopped.
    pub(crate) fn take_superseded(&self) -> Vec<(Window, i64)> {
        let mut buffer = self.buffer.lock();
        if buffer.stopped {
            return Vec::new();
        }
        std::mem::take(&mut buffer.superseded)
    }

    /// Take everything a stopped state still owes the store.
    ///
    /// Empty unless the state was stopped.
    pub(crate) fn drain_stopped(&self) -> Vec<(Window, i64)> {
        let mut buffer = self.buffer.lock();
        if !buffer.stopped {
            return Vec::new();
        }
        let mut owed = std::mem::take(&mut buffer.superseded);
        if let Some(window) = buffer.window.filter(|_| buffer.pending != 0) {
            owed.push((window, std::mem::take(&mut buffer.pending)));
            buffer.pending_messages = 0;
        }
        owed
    }

    /// Record the store count returned by a flush.
    pub(crate) fn record_synced(&self, window: Window, count: i64) {
        let mut buffer = self.buffer.lock();
        if buffer.window == Some(window) {
            buffer.synced = count;
            buffer.in_flight = 0;
        }
    }

    /// Put back a delta whose flush failed.
    pub(crate) fn restore_pending(&self, window: Window, delta: i64) {
        let mut buffer = self.buffer.lock();
        if buffer.window == Some(window) {
            buffer.in_flight = 0;
            buffer.pending += delta;
        } else {
            debug!(delta, "keeping unflushed delta of a superseded window");
            buffer.carry(window, delta);
        }
    }

    /// Put back superseded deltas whose flush failed.
    pub(crate) fn restore_superseded(&self, owed: impl IntoIterator<Item = (Window, i64)>) {
        let mut buffer = self.buffer.lock();
        for (window, delta) in owed {
            buffer.carry(window, delta);
        }
    }

    /// Clear the pending buffer without flushing.
    pub fn clear_pending(&self) {
        let mut buffer = self.buffer.lock();
        buffer.pending = 0;
        buffer.pending_messages = 0;
    }

    /// Whether a ticker is running.
    pub fn has_ticker(&self) -> bool {
        self.ticker.lock().is_some()
    }

    /// Whether the state was stopped by eviction.
    pub fn is_stopped(&self) -> bool {
        self.buffer.lock().stopped
    }

    /// Number of times a running ticker was stopped.
    pub fn ticker_stop_count(&self) -> usize {
        self.ticker_stops.load(Ordering::Acquire)
    }

    /// Install a ticker spawned by `spawn`, unless one runs or the state was
    /// stopped.
    pub(crate) fn install_ticker<F>(&self, spawn: F) -> bool
    where
        F: FnOnce(Arc<Notify>) -> JoinHandle<()>,
    {
        let mut slot = self.ticker.lock();
        if slot.is_some() || self.is_stopped() {
            return false;
        }
        let shutdown = Arc::new(Notify::new());
        let handle = spawn(shutdown.clone());
        *slot = Some(Ticker { handle, shutdown });
        true
    }

    /// Stop the state: regular flushes no longer take the buffer and the
    /// ticker, if any, is shut down before this returns. What the buffer
    /// still owes is left for [`drain_stopped`](Self::drain_stopped).
    pub(crate) fn stop(&self, key: &str) {
        self.buffer.lock().stopped = true;
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.stop();
            self.ticker_stops.fetch_add(1, Ordering::AcqRel);
            info!(key, "quota sync ticker stopped");
        }
    }
}
