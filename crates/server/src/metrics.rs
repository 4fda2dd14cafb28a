//! Lock-free server counters.
//!
//! The tick loop and device code update these with relaxed atomics; the
//! periodic stats logger reads them at its own pace.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::time::{Duration, Instant};

pub struct Metrics {
    // Monotonic counters
    ticks: AtomicU64,
    tick_ns_sum: AtomicU64,
    sync_tasks_run: AtomicU64,
    random_ticks: AtomicU64,
    foreign_added: AtomicU64,
    foreign_removed: AtomicU64,
    chunks_saved: AtomicU64,

    // Tick duration histogram buckets
    hist_under_1ms: AtomicU64,
    hist_1_10ms: AtomicU64,
    hist_10_50ms: AtomicU64,
    hist_over_50ms: AtomicU64,

    started_at: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
            tick_ns_sum: AtomicU64::new(0),
            sync_tasks_run: AtomicU64::new(0),
            random_ticks: AtomicU64::new(0),
            foreign_added: AtomicU64::new(0),
            foreign_removed: AtomicU64::new(0),
            chunks_saved: AtomicU64::new(0),
            hist_under_1ms: AtomicU64::new(0),
            hist_1_10ms: AtomicU64::new(0),
            hist_10_50ms: AtomicU64::new(0),
            hist_over_50ms: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Called once per host tick with the number of clock tasks it ran.
    pub fn record_tick(&self, tasks: usize, duration: Duration) {
        self.ticks.fetch_add(1, Relaxed);
        self.sync_tasks_run.fetch_add(tasks as u64, Relaxed);
        self.tick_ns_sum.fetch_add(duration.as_nanos() as u64, Relaxed);

        let bucket = match duration.as_millis() {
            0 => &self.hist_under_1ms,
            1..=9 => &self.hist_1_10ms,
            10..=49 => &self.hist_10_50ms,
            _ => &self.hist_over_50ms,
        };
        bucket.fetch_add(1, Relaxed);
    }

    pub fn record_random_tick(&self) {
        self.random_ticks.fetch_add(1, Relaxed);
    }

    pub fn record_foreign_diff(&self, added: usize, removed: usize) {
        self.foreign_added.fetch_add(added as u64, Relaxed);
        self.foreign_removed.fetch_add(removed as u64, Relaxed);
    }

    pub fn record_save(&self, chunks: usize) {
        self.chunks_saved.fetch_add(chunks as u64, Relaxed);
    }

    pub fn snapshot(&self, chunks_loaded: u64, networks: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs_f64(),
            ticks_total: self.ticks.load(Relaxed),
            tick_ns_sum: self.tick_ns_sum.load(Relaxed),
            sync_tasks_total: self.sync_tasks_run.load(Relaxed),
            random_ticks_total: self.random_ticks.load(Relaxed),
            foreign_added: self.foreign_added.load(Relaxed),
            foreign_removed: self.foreign_removed.load(Relaxed),
            chunks_saved: self.chunks_saved.load(Relaxed),
            chunks_loaded,
            networks,
            hist: [
                self.hist_under_1ms.load(Relaxed),
                self.hist_1_10ms.load(Relaxed),
                self.hist_10_50ms.load(Relaxed),
                self.hist_over_50ms.load(Relaxed),
            ],
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of all counters, logged as JSON.
#[derive(Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: f64,
    pub ticks_total: u64,
    pub tick_ns_sum: u64,
    pub sync_tasks_total: u64,
    pub random_ticks_total: u64,
    pub foreign_added: u64,
    pub foreign_removed: u64,
    pub chunks_saved: u64,
    pub chunks_loaded: u64,
    pub networks: u64,
    /// `[<1ms, 1-10ms, 10-50ms, >50ms]`
    pub hist: [u64; 4],
}

impl MetricsSnapshot {
    /// Mean tick duration over the whole uptime.
    pub fn mean_tick(&self) -> Duration {
        Duration::from_nanos(self.tick_ns_sum.checked_div(self.ticks_total).unwrap_or(0))
    }
}
