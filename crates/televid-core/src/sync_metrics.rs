//! A/V synchronization metrics and drift tracking.
//!
//! Instrumentation for measuring how well video presentation follows the
//! master clock. The decode/sync thread records every presented and dropped
//! frame; hosts and tests read a consistent snapshot. Lock-free — updates
//! come from the sync thread while snapshots are taken elsewhere.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Acceptable drift for streaming playback (±100ms). ±40ms is imperceptible,
/// but network jitter makes 100ms the practical threshold.
pub const SYNC_DRIFT_THRESHOLD_MS: i64 = 100;

/// Drift that is noticeable but tolerable (±150ms).
pub const SYNC_DRIFT_WARNING_MS: i64 = 150;

/// A/V synchronization metrics tracker.
#[derive(Clone, Default)]
pub struct SyncMetrics {
    inner: Arc<SyncMetricsInner>,
}

#[derive(Default)]
struct SyncMetricsInner {
    /// Current drift in microseconds (video - master, positive = video ahead).
    current_drift_us: AtomicI64,
    /// Largest drift ahead of the master seen so far.
    max_drift_ahead_us: AtomicI64,
    /// Largest drift behind the master seen so far (negative).
    max_drift_behind_us: AtomicI64,
    /// Sum of absolute drift for averaging.
    total_drift_us: AtomicU64,
    /// Presented frames recorded.
    presented_frames: AtomicU64,
    /// Frames dropped for being late beyond the catch-up window.
    dropped_frames: AtomicU64,
    /// Frames whose drift exceeded the sync threshold.
    out_of_sync_frames: AtomicU64,
}

/// Point-in-time view of the metrics.
#[derive(Debug, Clone, Default)]
pub struct SyncMetricsSnapshot {
    /// Current drift in microseconds.
    pub current_drift_us: i64,
    /// Maximum drift ahead of the master, microseconds.
    pub max_drift_ahead_us: i64,
    /// Maximum drift behind the master, microseconds (negative).
    pub max_drift_behind_us: i64,
    /// Average absolute drift, microseconds.
    pub avg_drift_us: u64,
    /// Presented frames.
    pub presented_frames: u64,
    /// Dropped frames.
    pub dropped_frames: u64,
    /// Frames beyond the sync threshold.
    pub out_of_sync_frames: u64,
}

impl SyncMetricsSnapshot {
    /// Current drift in milliseconds (signed).
    pub fn current_drift_ms(&self) -> i64 {
        self.current_drift_us / 1000
    }

    /// True when no presented frame exceeded the sync threshold.
    pub fn in_sync(&self) -> bool {
        self.out_of_sync_frames == 0
    }
}

impl SyncMetrics {
    /// Creates a metrics tracker with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a presented frame: video PTS vs. master time, in seconds.
    pub fn record_frame(&self, video_pts: f64, master_time: f64) {
        let drift_us = ((video_pts - master_time) * 1_000_000.0) as i64;
        let inner = &self.inner;

        inner.current_drift_us.store(drift_us, Ordering::Relaxed);
        inner.max_drift_ahead_us.fetch_max(drift_us, Ordering::Relaxed);
        inner.max_drift_behind_us.fetch_min(drift_us, Ordering::Relaxed);
        inner
            .total_drift_us
            .fetch_add(drift_us.unsigned_abs(), Ordering::Relaxed);
        inner.presented_frames.fetch_add(1, Ordering::Relaxed);

        if drift_us.abs() / 1000 > SYNC_DRIFT_THRESHOLD_MS {
            inner.out_of_sync_frames.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a frame dropped for lateness.
    pub fn record_drop(&self) {
        self.inner.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of dropped frames so far.
    pub fn dropped_frames(&self) -> u64 {
        self.inner.dropped_frames.load(Ordering::Relaxed)
    }

    /// Takes a consistent-enough snapshot for reporting.
    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        let inner = &self.inner;
        let samples = inner.presented_frames.load(Ordering::Relaxed);
        let total = inner.total_drift_us.load(Ordering::Relaxed);
        SyncMetricsSnapshot {
            current_drift_us: inner.current_drift_us.load(Ordering::Relaxed),
            max_drift_ahead_us: inner.max_drift_ahead_us.load(Ordering::Relaxed),
            max_drift_behind_us: inner.max_drift_behind_us.load(Ordering::Relaxed),
            avg_drift_us: if samples > 0 { total / samples } else { 0 },
            presented_frames: samples,
            dropped_frames: inner.dropped_frames.load(Ordering::Relaxed),
            out_of_sync_frames: inner.out_of_sync_frames.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_sync() {
        let metrics = SyncMetrics::new();
        for i in 0..100 {
            let t = i as f64 * 0.033;
            metrics.record_frame(t, t);
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.current_drift_ms(), 0);
        assert_eq!(snap.out_of_sync_frames, 0);
        assert_eq!(snap.presented_frames, 100);
        assert!(snap.in_sync());
    }

    #[test]
    fn test_video_ahead_counts_out_of_sync() {
        let metrics = SyncMetrics::new();
        for i in 0..10 {
            let master = i as f64 * 0.033;
            metrics.record_frame(master + 0.120, master);
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.current_drift_ms(), 120);
        assert!(snap.max_drift_ahead_us > 0);
        assert!(!snap.in_sync());
    }

    #[test]
    fn test_video_behind_within_threshold() {
        let metrics = SyncMetrics::new();
        for i in 0..10 {
            let master = i as f64 * 0.033;
            metrics.record_frame(master - 0.030, master);
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.current_drift_ms(), -30);
        assert!(snap.max_drift_behind_us < 0);
        assert!(snap.in_sync());
    }

    #[test]
    fn test_drop_counter() {
        let metrics = SyncMetrics::new();
        metrics.record_drop();
        metrics.record_drop();
        assert_eq!(metrics.snapshot().dropped_frames, 2);
    }
}
