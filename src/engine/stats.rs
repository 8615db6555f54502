// Live statistics aggregation: submission outcomes, retries and terminal counts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub rejected: u64,
    pub resubmitted: u64,
    pub installed: u64,
    pub failed: u64,
    pub canceled: u64,
    pub dropped_events: u64,
    pub active_sessions: usize,
    pub uptime_secs: u64,
}

pub struct StatsCollector {
    submitted: AtomicU64,
    rejected: AtomicU64,
    resubmitted: AtomicU64,
    installed: AtomicU64,
    failed: AtomicU64,
    canceled: AtomicU64,
    dropped_events: AtomicU64,
    started_at: Instant,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            resubmitted: AtomicU64::new(0),
            installed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            canceled: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resubmitted(&self) {
        self.resubmitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_installed(&self) {
        self.installed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_canceled(&self) {
        self.canceled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_event(&self) {
        self.dropped_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, active_sessions: usize) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            resubmitted: self.resubmitted.load(Ordering::Relaxed),
            installed: self.installed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            canceled: self.canceled.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            active_sessions,
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_basic() {
        let stats = StatsCollector::new();
        stats.record_submitted();
        stats.record_submitted();
        stats.record_rejected();
        stats.record_resubmitted();
        stats.record_installed();
        stats.record_dropped_event();
        stats.record_dropped_event();

        let snap = stats.snapshot(3);
        assert_eq!(snap.submitted, 2);
        assert_eq!(snap.rejected, 1);
        assert_eq!(snap.resubmitted, 1);
        assert_eq!(snap.installed, 1);
        assert_eq!(snap.failed, 0);
        assert_eq!(snap.canceled, 0);
        assert_eq!(snap.dropped_events, 2);
        assert_eq!(snap.active_sessions, 3);
    }
}
