//! Presentation clocks and the master-clock discipline.
//!
//! Each stream (audio, video) owns a presentation clock: the PTS of the last
//! presented unit anchored to the wall-clock instant it was presented at.
//! Between updates a clock free-runs from its anchor. The session's
//! [`ClockModel`] selects which clock is the master — audio, video, or an
//! external wall clock — and computes the drift the presentation scheduler
//! uses to decide early/on-time/late delivery.
//!
//! Updates carry a generation serial; after a seek or stream restart the
//! serial is bumped and in-flight updates from the previous generation are
//! discarded instead of corrupting the new timeline.
//!
//! Writers never block readers: timestamps are stored as f64 bits in atomics,
//! so `master_time()` is safe from the sync thread while the audio pull
//! callback advances the audio clock. Readers may observe a slightly stale
//! value; drift is evaluated against thresholds, never exact equality.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::media::ClockSource;

/// Identifies a per-stream clock when querying drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// The audio presentation clock.
    Audio,
    /// The video presentation clock.
    Video,
}

/// One stream's presentation clock.
///
/// Single writer per clock; readers are lock-free. The anchor is stored as
/// microseconds-since-session-epoch + 1 so that 0 means "never set" and an
/// anchor at the epoch itself remains representable.
struct StreamClock {
    /// Last presented PTS in seconds (f64 bits).
    pts_bits: AtomicU64,
    /// Wall anchor of the last update, micros since epoch + 1 (0 = unset).
    anchor_us_plus1: AtomicU64,
}

impl StreamClock {
    fn new() -> Self {
        Self {
            pts_bits: AtomicU64::new(0f64.to_bits()),
            anchor_us_plus1: AtomicU64::new(0),
        }
    }

    fn set(&self, pts: f64, now_us: u64) {
        self.pts_bits.store(pts.to_bits(), Ordering::Relaxed);
        // Anchor store is the Release point — a reader that sees the new
        // anchor also sees the new PTS.
        self.anchor_us_plus1
            .store(now_us.saturating_add(1), Ordering::Release);
    }

    fn is_set(&self) -> bool {
        self.anchor_us_plus1.load(Ordering::Acquire) != 0
    }

    /// Clock time at `now_us`: last PTS plus elapsed since the anchor.
    fn time(&self, now_us: u64) -> Option<f64> {
        let anchor_plus1 = self.anchor_us_plus1.load(Ordering::Acquire);
        if anchor_plus1 == 0 {
            return None;
        }
        let pts = f64::from_bits(self.pts_bits.load(Ordering::Relaxed));
        let elapsed_us = now_us.saturating_sub(anchor_plus1 - 1);
        Some(pts + elapsed_us as f64 / 1_000_000.0)
    }
}

/// Tracks elapsed presentation time for audio, video, and an external
/// reference, and exposes the single master time used for timing decisions.
pub struct ClockModel {
    source: ClockSource,
    epoch: Instant,
    serial: AtomicU64,
    audio: StreamClock,
    video: StreamClock,
}

impl ClockModel {
    /// Creates a clock model with the given master discipline.
    ///
    /// The discipline is immutable for the model's lifetime.
    pub fn new(source: ClockSource) -> Self {
        Self {
            source,
            epoch: Instant::now(),
            serial: AtomicU64::new(0),
            audio: StreamClock::new(),
            video: StreamClock::new(),
        }
    }

    /// The active master discipline.
    pub fn source(&self) -> ClockSource {
        self.source
    }

    /// Current generation serial. Updates must carry this value to apply.
    pub fn serial(&self) -> u64 {
        self.serial.load(Ordering::Acquire)
    }

    /// Invalidates in-flight clock updates (seek / stream restart).
    /// Returns the new serial.
    pub fn bump_serial(&self) -> u64 {
        let new = self.serial.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!("clock serial bumped to {new}");
        new
    }

    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// Advances the audio clock to `pts` (seconds). Updates bearing a stale
    /// serial are discarded, never applied.
    pub fn advance_audio(&self, pts: f64, serial: u64) {
        if serial != self.serial() {
            tracing::trace!("discarding stale audio clock update (serial {serial})");
            return;
        }
        self.audio.set(pts, self.now_us());
    }

    /// Advances the video clock to `pts` (seconds). Stale serials are discarded.
    pub fn advance_video(&self, pts: f64, serial: u64) {
        if serial != self.serial() {
            tracing::trace!("discarding stale video clock update (serial {serial})");
            return;
        }
        self.video.set(pts, self.now_us());
    }

    /// Audio clock time in seconds, if the clock has ever been advanced.
    pub fn audio_time(&self) -> Option<f64> {
        self.audio.time(self.now_us())
    }

    /// Video clock time in seconds, if the clock has ever been advanced.
    pub fn video_time(&self) -> Option<f64> {
        self.video.time(self.now_us())
    }

    /// True once the master clock has a defined time.
    ///
    /// The external clock always runs; a stream-backed master starts with the
    /// first advance of its stream.
    pub fn master_started(&self) -> bool {
        match self.source {
            ClockSource::AudioMaster => self.audio.is_set(),
            ClockSource::VideoMaster => self.video.is_set(),
            ClockSource::ExternalClock => true,
        }
    }

    /// The master time in seconds.
    ///
    /// Returns 0.0 for a stream-backed master that has not started yet. For
    /// `ExternalClock` the value is monotonically non-decreasing for the
    /// session's lifetime.
    pub fn master_time(&self) -> f64 {
        let now_us = self.now_us();
        match self.source {
            ClockSource::AudioMaster => self.audio.time(now_us).unwrap_or(0.0),
            ClockSource::VideoMaster => self.video.time(now_us).unwrap_or(0.0),
            ClockSource::ExternalClock => now_us as f64 / 1_000_000.0,
        }
    }

    /// Drift of a stream clock relative to the master:
    /// `stream time - master time`, in seconds.
    ///
    /// A never-advanced stream clock reports zero drift.
    pub fn drift(&self, kind: StreamKind) -> f64 {
        let now_us = self.now_us();
        let stream = match kind {
            StreamKind::Audio => self.audio.time(now_us),
            StreamKind::Video => self.video.time(now_us),
        };
        match stream {
            Some(t) => t - self.master_time(),
            None => 0.0,
        }
    }

    /// Resynchronizes the master clock to `pts` after a desynchronization.
    ///
    /// Used when a dependent stream has drifted beyond the session's desync
    /// threshold: rather than forcing the dependent clock to chase the
    /// master, the master adopts the dependent's time. The external clock is
    /// never resynchronized — its monotonicity is part of its contract.
    pub fn resync_master(&self, pts: f64, serial: u64) {
        if serial != self.serial() {
            return;
        }
        match self.source {
            ClockSource::AudioMaster => {
                tracing::debug!("resyncing audio master clock to {pts:.3}s");
                self.audio.set(pts, self.now_us());
            }
            ClockSource::VideoMaster => {
                tracing::debug!("resyncing video master clock to {pts:.3}s");
                self.video.set(pts, self.now_us());
            }
            ClockSource::ExternalClock => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_external_clock_monotonic() {
        let clock = ClockModel::new(ClockSource::ExternalClock);
        let mut last = clock.master_time();
        for _ in 0..50 {
            let now = clock.master_time();
            assert!(now >= last, "external master time went backwards");
            last = now;
        }
        assert!(clock.master_started());
    }

    #[test]
    fn test_audio_master_free_runs_from_anchor() {
        let clock = ClockModel::new(ClockSource::AudioMaster);
        assert!(!clock.master_started());
        assert_eq!(clock.master_time(), 0.0);

        clock.advance_audio(5.0, clock.serial());
        assert!(clock.master_started());
        let t0 = clock.master_time();
        assert!(t0 >= 5.0);

        std::thread::sleep(Duration::from_millis(10));
        let t1 = clock.master_time();
        assert!(t1 > t0, "clock should free-run between updates");
        assert!(t1 - 5.0 < 1.0);
    }

    #[test]
    fn test_stale_serial_discarded() {
        let clock = ClockModel::new(ClockSource::AudioMaster);
        let old = clock.serial();
        clock.advance_audio(1.0, old);
        clock.bump_serial();

        // An in-flight update from before the seek must not apply
        clock.advance_audio(99.0, old);
        let t = clock.audio_time().unwrap();
        assert!(t < 2.0, "stale update applied: {t}");

        clock.advance_audio(3.0, clock.serial());
        assert!(clock.audio_time().unwrap() >= 3.0);
    }

    #[test]
    fn test_drift_against_master() {
        let clock = ClockModel::new(ClockSource::AudioMaster);
        let serial = clock.serial();
        clock.advance_audio(10.0, serial);
        clock.advance_video(9.5, serial);

        let drift = clock.drift(StreamKind::Video);
        assert!(
            (drift + 0.5).abs() < 0.05,
            "video should lag audio by ~0.5s, got {drift}"
        );
        // The master's own drift is ~zero by definition
        assert!(clock.drift(StreamKind::Audio).abs() < 0.05);
    }

    #[test]
    fn test_unstarted_stream_reports_zero_drift() {
        let clock = ClockModel::new(ClockSource::ExternalClock);
        assert_eq!(clock.drift(StreamKind::Video), 0.0);
    }

    #[test]
    fn test_resync_master_adopts_dependent_time() {
        let clock = ClockModel::new(ClockSource::AudioMaster);
        let serial = clock.serial();
        clock.advance_audio(1.0, serial);
        clock.resync_master(20.0, serial);
        assert!(clock.master_time() >= 20.0);
    }

    #[test]
    fn test_external_clock_ignores_resync() {
        let clock = ClockModel::new(ClockSource::ExternalClock);
        let before = clock.master_time();
        clock.resync_master(100.0, clock.serial());
        let after = clock.master_time();
        assert!(after < 50.0, "external clock must not jump");
        assert!(after >= before);
    }
}
