//! Pull-based audio buffer between the decode thread and the host callback.
//!
//! Lock-free SPSC ring of interleaved signed 16-bit samples. The decode
//! thread writes decoded chunks at its own pace; the host's audio subsystem
//! pulls exactly the number of bytes its device callback needs. A pull never
//! blocks and never under-delivers: whatever decoded data is missing is
//! padded with silence, because audio devices require fixed-size callbacks.
//!
//! Design: true SPSC — only the producer modifies `write_pos`, only the
//! consumer modifies `read_pos`. On overflow the producer overwrites old data
//! and the consumer detects the skip and catches up. Each pull advances the
//! session's audio clock with the presentation timestamp of the samples
//! consumed, which is how the audio-master discipline stays accurate without
//! a separate timer thread.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::clock::ClockModel;
use crate::media::AudioParams;

/// Maximum linear volume. Values above are clamped.
pub const VOLUME_MAX: u8 = 100;

/// Configuration for the pull buffer.
#[derive(Debug, Clone)]
pub struct PullBufferConfig {
    /// Total capacity in samples (interleaved). Rounded up to a power of two.
    pub capacity_samples: usize,
    /// Samples that must accumulate before the first pull delivers data.
    pub prefill_samples: usize,
}

impl PullBufferConfig {
    /// Config sized for the negotiated params: 500ms capacity, 50ms prefill.
    pub fn for_params(params: &AudioParams) -> Self {
        let sps = params.sample_rate as usize * params.channels as usize;
        Self {
            capacity_samples: (sps / 2).max(1024),
            prefill_samples: sps / 20,
        }
    }
}

impl Default for PullBufferConfig {
    fn default() -> Self {
        // 48kHz stereo until negotiation replaces it
        Self {
            capacity_samples: 48_000,
            prefill_samples: 4_800,
        }
    }
}

/// Mixes `src` into `dest` at the given linear volume, saturating at the
/// i16 range instead of wrapping. Both slices are little-endian S16 bytes;
/// trailing odd bytes are ignored.
pub fn mix_audio_s16(dest: &mut [u8], src: &[u8], volume: u8) {
    let vol = i32::from(volume.min(VOLUME_MAX));
    let n = dest.len().min(src.len()) / 2 * 2;
    for i in (0..n).step_by(2) {
        let d = i16::from_le_bytes([dest[i], dest[i + 1]]) as i32;
        let s = i16::from_le_bytes([src[i], src[i + 1]]) as i32;
        let mixed = (d + s * vol / i32::from(VOLUME_MAX))
            .clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
        let bytes = mixed.to_le_bytes();
        dest[i] = bytes[0];
        dest[i + 1] = bytes[1];
    }
}

/// Bounded sample buffer the host audio output pulls from.
pub struct AudioPullBuffer {
    /// Sample slots (i16 stored as bits) — atomic to avoid data races when
    /// the producer overwrites a slot the consumer is reading during overflow.
    slots: Box<[AtomicU16]>,
    /// Capacity mask (capacity - 1, power-of-two modulo).
    mask: usize,
    /// Actual capacity in samples (power of two).
    capacity: usize,
    /// Write position, monotonically increasing. Producer-only.
    write_pos: AtomicUsize,
    /// Read position, monotonically increasing. Consumer-only.
    read_pos: AtomicUsize,
    /// Whether the prefill threshold has been reached since the last flush.
    prefilled: AtomicBool,
    prefill_threshold: usize,
    /// Flush generation; consumer snaps to the write position on change.
    flush_generation: AtomicU64,
    consumer_generation: AtomicU64,
    /// PTS of the first sample of the current generation, micros + 1 (0 = unset).
    base_pts_us_plus1: AtomicU64,
    /// Samples consumed since the base PTS was seeded.
    samples_consumed: AtomicU64,
    /// Negotiated format; zero until [`configure`](Self::configure).
    sample_rate: AtomicU32,
    channels: AtomicU32,
    overflow_count: AtomicU64,
    underrun_count: AtomicU64,
    /// Session clock advanced on every pull.
    clock: Arc<ClockModel>,
}

impl AudioPullBuffer {
    /// Creates a pull buffer bound to the session clock.
    pub fn new(config: PullBufferConfig, clock: Arc<ClockModel>) -> Self {
        let capacity = config.capacity_samples.max(1024).next_power_of_two();
        Self {
            slots: (0..capacity).map(|_| AtomicU16::new(0)).collect(),
            mask: capacity - 1,
            capacity,
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
            prefilled: AtomicBool::new(false),
            prefill_threshold: config.prefill_samples.min(capacity / 2),
            flush_generation: AtomicU64::new(0),
            consumer_generation: AtomicU64::new(0),
            base_pts_us_plus1: AtomicU64::new(0),
            samples_consumed: AtomicU64::new(0),
            sample_rate: AtomicU32::new(0),
            channels: AtomicU32::new(0),
            overflow_count: AtomicU64::new(0),
            underrun_count: AtomicU64::new(0),
            clock,
        }
    }

    /// Records the negotiated audio format for sample-to-time conversion.
    pub fn configure(&self, params: &AudioParams) {
        self.sample_rate.store(params.sample_rate, Ordering::Relaxed);
        self.channels
            .store(u32::from(params.channels), Ordering::Relaxed);
    }

    /// Buffer capacity in samples.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current fill level in samples.
    pub fn fill_level(&self) -> usize {
        let wp = self.write_pos.load(Ordering::Relaxed);
        let rp = self.read_pos.load(Ordering::Relaxed);
        wp.wrapping_sub(rp).min(self.capacity)
    }

    /// Number of overflow events (oldest samples overwritten).
    pub fn overflow_count(&self) -> u64 {
        self.overflow_count.load(Ordering::Relaxed)
    }

    /// Number of underrun events (pull found less data than requested).
    pub fn underrun_count(&self) -> u64 {
        self.underrun_count.load(Ordering::Relaxed)
    }

    /// Requests a flush (seek / stream restart). The consumer snaps its read
    /// position to the write position on the next pull; prefill and the base
    /// PTS are reset so the new timeline reseeds cleanly.
    pub fn flush(&self) {
        self.prefilled.store(false, Ordering::Relaxed);
        self.base_pts_us_plus1.store(0, Ordering::Relaxed);
        // Generation increment is the Release point for the resets above
        self.flush_generation.fetch_add(1, Ordering::Release);
        tracing::debug!("audio pull buffer flush requested");
    }

    /// Writes decoded samples. Producer side; never blocks.
    ///
    /// If the buffer is full, the oldest samples are overwritten and the
    /// consumer catches up on its next pull. The first write after a flush
    /// seeds the base PTS used for consumed-sample timestamping.
    pub fn write(&self, samples: &[i16], pts: f64) {
        if samples.is_empty() {
            return;
        }

        if self.base_pts_us_plus1.load(Ordering::Relaxed) == 0 {
            let us = (pts.max(0.0) * 1_000_000.0) as u64;
            self.base_pts_us_plus1
                .store(us.saturating_add(1), Ordering::Relaxed);
            self.samples_consumed.store(0, Ordering::Relaxed);
        }

        let wp = self.write_pos.load(Ordering::Relaxed);
        let rp = self.read_pos.load(Ordering::Acquire);
        if wp.wrapping_add(samples.len()).wrapping_sub(rp) > self.capacity {
            self.overflow_count.fetch_add(1, Ordering::Relaxed);
        }

        let mut idx = wp & self.mask;
        for &sample in samples {
            self.slots[idx].store(sample as u16, Ordering::Relaxed);
            idx = (idx + 1) & self.mask;
        }
        // Makes the samples visible to the consumer
        self.write_pos
            .store(wp.wrapping_add(samples.len()), Ordering::Release);

        if !self.prefilled.load(Ordering::Relaxed) {
            let fill = self
                .write_pos
                .load(Ordering::Relaxed)
                .wrapping_sub(self.read_pos.load(Ordering::Relaxed));
            if fill >= self.prefill_threshold {
                self.prefilled.store(true, Ordering::Release);
                tracing::debug!(
                    "audio pull buffer prefilled: {fill} samples (threshold {})",
                    self.prefill_threshold
                );
            }
        }
    }

    /// Fills `dest` with volume-scaled samples, padding any deficit with
    /// silence. Returns the number of real (non-padded) audio bytes.
    ///
    /// Volume is linear 0..=100; scaling saturates at the i16 range. Never
    /// blocks — this is called from the host's audio device callback.
    pub fn pull(&self, dest: &mut [u8], volume: u8) -> usize {
        self.consume(dest, Some(volume))
    }

    /// Fills `dest` with unscaled samples (silence-padded); the caller mixes
    /// through the host's own mixer. Returns real audio bytes.
    pub fn pull_raw(&self, dest: &mut [u8]) -> usize {
        self.consume(dest, None)
    }

    fn consume(&self, dest: &mut [u8], volume: Option<u8>) -> usize {
        dest.fill(0);

        let rate = self.sample_rate.load(Ordering::Relaxed) as u64;
        let channels = self.channels.load(Ordering::Relaxed) as u64;
        if rate == 0 || channels == 0 {
            return 0;
        }

        // Flush check before the prefill gate (flush clears prefill)
        let gen = self.flush_generation.load(Ordering::Acquire);
        if gen != self.consumer_generation.load(Ordering::Relaxed) {
            self.consumer_generation.store(gen, Ordering::Relaxed);
            let wp = self.write_pos.load(Ordering::Acquire);
            self.read_pos.store(wp, Ordering::Release);
            self.samples_consumed.store(0, Ordering::Relaxed);
            return 0;
        }

        if !self.prefilled.load(Ordering::Acquire) {
            return 0;
        }

        let mut rp = self.read_pos.load(Ordering::Relaxed);
        let wp = self.write_pos.load(Ordering::Acquire);

        // Producer lapped us: skip to mid-buffer for headroom
        let fill = wp.wrapping_sub(rp);
        if fill > self.capacity {
            rp = wp.wrapping_sub(self.capacity / 2);
            self.read_pos.store(rp, Ordering::Relaxed);
        }

        let wanted = dest.len() / 2;
        let available = wp.wrapping_sub(rp).min(wanted);

        let vol = volume.map(|v| i32::from(v.min(VOLUME_MAX)));
        for (i, out) in dest.chunks_exact_mut(2).take(available).enumerate() {
            let raw = self.slots[(rp.wrapping_add(i)) & self.mask].load(Ordering::Relaxed) as i16;
            let sample = match vol {
                Some(v) => (i32::from(raw) * v / i32::from(VOLUME_MAX))
                    .clamp(i32::from(i16::MIN), i32::from(i16::MAX))
                    as i16,
                None => raw,
            };
            let bytes = sample.to_le_bytes();
            out[0] = bytes[0];
            out[1] = bytes[1];
        }
        self.read_pos
            .store(rp.wrapping_add(available), Ordering::Release);

        if available < wanted {
            self.underrun_count.fetch_add(1, Ordering::Relaxed);
        }

        if available > 0 {
            let consumed = self
                .samples_consumed
                .fetch_add(available as u64, Ordering::Relaxed)
                + available as u64;
            let base_plus1 = self.base_pts_us_plus1.load(Ordering::Relaxed);
            if base_plus1 > 0 {
                let base = (base_plus1 - 1) as f64 / 1_000_000.0;
                let pts = base + consumed as f64 / (rate * channels) as f64;
                self.clock.advance_audio(pts, self.clock.serial());
            }
        }

        available * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{ClockSource, SampleFormat};

    fn buffer(prefill: usize) -> AudioPullBuffer {
        let clock = Arc::new(ClockModel::new(ClockSource::AudioMaster));
        let buf = AudioPullBuffer::new(
            PullBufferConfig {
                capacity_samples: 1024,
                prefill_samples: prefill,
            },
            clock,
        );
        buf.configure(&AudioParams::new(3, 2, 48_000, SampleFormat::S16));
        buf
    }

    #[test]
    fn test_pull_exact_length_with_silence_padding() {
        let buf = buffer(2);
        buf.write(&[100, 200, 300], 0.0);

        // Ask for more than is available: 8 samples = 16 bytes
        let mut dest = [0xAAu8; 16];
        let real = buf.pull(&mut dest, 100);
        assert_eq!(real, 6, "three real samples -> six bytes");

        assert_eq!(i16::from_le_bytes([dest[0], dest[1]]), 100);
        assert_eq!(i16::from_le_bytes([dest[2], dest[3]]), 200);
        assert_eq!(i16::from_le_bytes([dest[4], dest[5]]), 300);
        // Deficit is silence, not leftovers and not a short buffer
        assert!(dest[6..].iter().all(|&b| b == 0));
        assert_eq!(buf.underrun_count(), 1);
    }

    #[test]
    fn test_volume_scaling_linear() {
        let buf = buffer(1);
        buf.write(&[1000, -1000], 0.0);

        let mut dest = [0u8; 4];
        buf.pull(&mut dest, 50);
        assert_eq!(i16::from_le_bytes([dest[0], dest[1]]), 500);
        assert_eq!(i16::from_le_bytes([dest[2], dest[3]]), -500);
    }

    #[test]
    fn test_volume_zero_is_silence() {
        let buf = buffer(1);
        buf.write(&[12345, -12345], 0.0);

        let mut dest = [0u8; 4];
        let real = buf.pull(&mut dest, 0);
        assert_eq!(real, 4);
        assert!(dest.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_mix_saturates_no_wraparound() {
        // dest already near positive rail; mixing loud source must clamp
        let mut dest = i16::MAX.to_le_bytes().to_vec();
        let src = i16::MAX.to_le_bytes().to_vec();
        mix_audio_s16(&mut dest, &src, 100);
        assert_eq!(i16::from_le_bytes([dest[0], dest[1]]), i16::MAX);

        let mut dest = i16::MIN.to_le_bytes().to_vec();
        let src = i16::MIN.to_le_bytes().to_vec();
        mix_audio_s16(&mut dest, &src, 100);
        assert_eq!(i16::from_le_bytes([dest[0], dest[1]]), i16::MIN);
    }

    #[test]
    fn test_prefill_gate() {
        let buf = buffer(10);
        buf.write(&[1, 2, 3], 0.0);

        let mut dest = [0u8; 6];
        assert_eq!(buf.pull(&mut dest, 100), 0, "still prefilling");

        buf.write(&[4, 5, 6, 7, 8, 9, 10], 0.1);
        assert!(buf.pull(&mut dest, 100) > 0);
        assert_eq!(i16::from_le_bytes([dest[0], dest[1]]), 1);
    }

    #[test]
    fn test_pull_advances_audio_clock() {
        let clock = Arc::new(ClockModel::new(ClockSource::AudioMaster));
        let buf = AudioPullBuffer::new(
            PullBufferConfig {
                capacity_samples: 1024,
                prefill_samples: 1,
            },
            Arc::clone(&clock),
        );
        // 1kHz mono so sample counts map to milliseconds
        buf.configure(&AudioParams::new(0, 1, 1000, SampleFormat::S16));

        let samples: Vec<i16> = (0..500).map(|i| i as i16).collect();
        buf.write(&samples, 2.0);
        assert!(clock.audio_time().is_none(), "clock starts on first pull");

        let mut dest = [0u8; 200]; // 100 samples = 100ms at 1kHz mono
        buf.pull(&mut dest, 100);

        let t = clock.audio_time().expect("audio clock set by pull");
        assert!((t - 2.1).abs() < 0.05, "expected ~2.1s, got {t}");
    }

    #[test]
    fn test_flush_resets_timeline() {
        let buf = buffer(1);
        buf.write(&[1, 2, 3, 4], 0.0);
        let mut dest = [0u8; 4];
        assert!(buf.pull(&mut dest, 100) > 0);

        buf.flush();
        // First pull after flush snaps and delivers silence
        assert_eq!(buf.pull(&mut dest, 100), 0);
        // Prefill must be re-reached before data flows again
        buf.write(&[7, 8], 5.0);
        assert!(buf.pull(&mut dest, 100) > 0);
        assert_eq!(i16::from_le_bytes([dest[0], dest[1]]), 7);
    }

    #[test]
    fn test_overflow_overwrites_oldest() {
        let buf = buffer(1);
        let fill: Vec<i16> = (0..1024).map(|i| i as i16).collect();
        buf.write(&fill, 0.0);
        buf.write(&[9999; 100], 0.0);
        assert!(buf.overflow_count() > 0);

        // Consumer detects the lap and still gets valid samples
        let mut dest = [0u8; 8];
        assert!(buf.pull(&mut dest, 100) > 0);
    }

    #[test]
    fn test_unconfigured_buffer_delivers_silence() {
        let clock = Arc::new(ClockModel::new(ClockSource::AudioMaster));
        let buf = AudioPullBuffer::new(PullBufferConfig::default(), clock);
        buf.write(&[5, 6, 7], 0.0);

        let mut dest = [0xFFu8; 8];
        assert_eq!(buf.pull(&mut dest, 100), 0);
        assert!(dest.iter().all(|&b| b == 0));
    }
}
