//! In-memory counter store with automatic garbage collection.
//!
//! This store uses `DashMap` for thread-safe concurrent access and drops the
//! counters of windows that ended long enough ago.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::Result;
use crate::storage::{counter_key, current_timestamp_secs, CounterStore};

/// Garbage collection interval configuration.
#[derive(Debug, Clone)]
pub enum GcInterval {
    /// Run GC every N requests.
    Requests(u64),
    /// Run GC at fixed time intervals.
    Duration(Duration),
    /// Disable automatic GC.
    Manual,
}

impl Default for GcInterval {
    fn default() -> Self {
        Self::Requests(10000)
    }
}

/// Garbage collection configuration.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// When to trigger GC.
    pub interval: GcInterval,
    /// How long a counter is kept after its window ended (default: 1 hour).
    pub max_age: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval: GcInterval::default(),
            max_age: Duration::from_secs(3600),
        }
    }
}

impl GcConfig {
    /// Create config with request-based GC.
    pub fn on_requests(count: u64) -> Self {
        Self {
            interval: GcInterval::Requests(count),
            ..Default::default()
        }
    }

    /// Create config with time-based GC.
    pub fn on_duration(interval: Duration) -> Self {
        Self {
            interval: GcInterval::Duration(interval),
            ..Default::default()
        }
    }

    /// Create config with manual GC only.
    pub fn manual() -> Self {
        Self {
            interval: GcInterval::Manual,
            ..Default::default()
        }
    }

    /// Set how long counters outlive their window.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }
}

/// A window counter.
#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    count: i64,
    window_end: i64,
}

/// In-memory counter store with garbage collection.
///
/// Counts live only in this process, so buckets on other instances do not
/// see them. Useful for single-node deployments and tests.
///
/// # Example
///
/// ```ignore
/// use quota_bucket::storage::{MemoryCounterStore, GcConfig};
/// use std::time::Duration;
///
/// // Default GC (every 10000 requests)
/// let store = MemoryCounterStore::new();
///
/// // Custom GC interval
/// let store = MemoryCounterStore::with_gc(GcConfig::on_duration(Duration::from_secs(60)));
/// ```
pub struct MemoryCounterStore {
    data: Arc<DashMap<String, WindowCounter>>,
    gc_config: GcConfig,
    request_count: AtomicU64,
    gc_lock: Mutex<()>,
    shutdown: Arc<Notify>,
}

impl std::fmt::Debug for MemoryCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCounterStore")
            .field("counters", &self.data.len())
            .field("gc_config", &self.gc_config)
            .finish()
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCounterStore {
    /// Create a new memory store with default GC configuration.
    pub fn new() -> Self {
        Self::with_gc(GcConfig::default())
    }

    /// Create a new memory store with custom GC configuration.
    ///
    /// Duration-based GC spawns a task and must be called inside a tokio
    /// runtime.
    pub fn with_gc(gc_config: GcConfig) -> Self {
        let store = Self {
            data: Arc::new(DashMap::new()),
            gc_config: gc_config.clone(),
            request_count: AtomicU64::new(0),
            gc_lock: Mutex::new(()),
            shutdown: Arc::new(Notify::new()),
        };

        if let GcInterval::Duration(interval) = gc_config.interval {
            store.start_gc_task(interval);
        }

        store
    }

    /// Start background GC task.
    fn start_gc_task(&self, interval: Duration) {
        let data = self.data.clone();
        let max_age = self.gc_config.max_age;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        run_gc_on_map(&data, max_age);
                    }
                    _ = shutdown.notified() => {
                        break;
                    }
                }
            }
        });
    }

    /// Manually trigger garbage collection.
    pub fn run_gc(&self) {
        run_gc_on_map(&self.data, self.gc_config.max_age);
    }

    /// Get the number of counters currently stored.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Clear all counters.
    pub fn clear(&self) {
        self.data.clear();
    }

    /// Check if GC should run and run it if needed.
    fn maybe_run_gc(&self) {
        if let GcInterval::Requests(threshold) = self.gc_config.interval {
            let count = self.request_count.fetch_add(1, Ordering::Relaxed);
            if threshold > 0 && count % threshold == 0 && count > 0 {
                // Try to acquire GC lock (non-blocking)
                if let Some(_guard) = self.gc_lock.try_lock() {
                    run_gc_on_map(&self.data, self.gc_config.max_age);
                }
            }
        }
    }
}

impl Drop for MemoryCounterStore {
    fn drop(&mut self) {
        // notify_one stores a permit if the task is between ticks.
        self.shutdown.notify_one();
    }
}

/// Drop counters whose window ended more than `max_age` ago.
fn run_gc_on_map(data: &DashMap<String, WindowCounter>, max_age: Duration) {
    let max_age_secs = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
    let cutoff = current_timestamp_secs().saturating_sub(max_age_secs);
    let before = data.len();

    data.retain(|_, counter| counter.window_end > cutoff);

    debug!(removed = before.saturating_sub(data.len()), "counter store gc");
}

impl CounterStore for MemoryCounterStore {
    async fn get_count(
        &self,
        tenant_id: &str,
        quota_id: &str,
        window_start: i64,
        window_end: i64,
    ) -> Result<i64> {
        self.maybe_run_gc();

        let key = counter_key(tenant_id, quota_id, window_start, window_end);
        Ok(self.data.get(&key).map(|counter| counter.count).unwrap_or(0))
    }

    async fn increment_and_get_count(
        &self,
        tenant_id: &str,
        quota_id: &str,
        delta: i64,
        window_start: i64,
        window_end: i64,
    ) -> Result<i64> {
        self.maybe_run_gc();

        let key = counter_key(tenant_id, quota_id, window_start, window_end);
        // The entry guard holds the shard lock, so read-add-return is atomic.
        let new_count = self
            .data
            .entry(key)
            .and_modify(|counter| counter.count += delta)
            .or_insert(WindowCounter {
                count: delta,
                window_end,
            })
            .count;

        Ok(new_count)
    }
}
