use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Local;
use tracing::info;

// ==========================================
// Counters shared by interception, releaser and teardown
// ==========================================
#[derive(Debug, Default)]
pub struct ReplayStats {
    passed: AtomicU64,
    held: AtomicU64,
    dropped: AtomicU64,
    released: AtomicU64,
    flushed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub passed: u64,
    pub held: u64,
    pub dropped: u64,
    pub released: u64,
    pub flushed: u64,
}

impl StatsSnapshot {
    /// Packets parked and not yet handed back.
    pub fn backlog(&self) -> u64 {
        self.held.saturating_sub(self.released + self.flushed)
    }
}

impl ReplayStats {
    pub fn record_passed(&self) {
        self.passed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_held(&self) {
        self.held.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_released(&self, n: u64) {
        self.released.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_flushed(&self, n: u64) {
        self.flushed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            passed: self.passed.load(Ordering::Relaxed),
            held: self.held.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
        }
    }
}

/// Periodic one-line report, emitted only when something moved.
pub struct StatsReporter {
    interval: Duration,
    last_report: Instant,
    last: StatsSnapshot,
}

impl StatsReporter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_report: Instant::now(),
            last: StatsSnapshot::default(),
        }
    }

    pub fn check_and_report(&mut self, stats: &ReplayStats) -> Option<StatsSnapshot> {
        let elapsed = self.last_report.elapsed();
        if elapsed < self.interval {
            return None;
        }
        self.last_report = Instant::now();

        let now = stats.snapshot();
        if now == self.last {
            return None;
        }
        let per_sec = |cur: u64, prev: u64| (cur - prev) as f64 / elapsed.as_secs_f64();
        info!(
            "[{}] passed {:.0}/s held {:.0}/s released {:.0}/s dropped {} backlog {}",
            Local::now().format("%H:%M:%S"),
            per_sec(now.passed, self.last.passed),
            per_sec(now.held, self.last.held),
            per_sec(now.released, self.last.released),
            now.dropped,
            now.backlog(),
        );
        self.last = now;
        Some(now)
    }
}
