//! Core media types and the decode-library boundary.
//!
//! This module provides the foundational types shared by the playback core:
//! the error taxonomy, negotiated audio parameters, video geometry, the
//! opaque option dictionaries forwarded to the decode library, and the
//! [`MediaDecoder`] trait that abstracts demux/decode behind a single seam.

use std::collections::HashMap;
use std::time::Duration;

/// Errors that can occur in the playback core.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackError {
    /// Malformed locator, null/empty required argument, or a stream-id collision.
    InvalidInput(String),
    /// The host rejected or could not supply audio/video parameters.
    Negotiation(String),
    /// Fetch/open/read failure from the media source.
    Io(String),
    /// Cooperative cancellation was observed mid-operation.
    Aborted,
    /// Closed-set dispatch violated. A defect, not a recoverable condition.
    Unreachable(String),
}

impl std::fmt::Display for PlaybackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackError::InvalidInput(msg) => write!(f, "Invalid input: {msg}"),
            PlaybackError::Negotiation(msg) => write!(f, "Negotiation failed: {msg}"),
            PlaybackError::Io(msg) => write!(f, "I/O error: {msg}"),
            PlaybackError::Aborted => write!(f, "Operation aborted"),
            PlaybackError::Unreachable(msg) => write!(f, "Unreachable dispatch: {msg}"),
        }
    }
}

impl std::error::Error for PlaybackError {}

/// Which clock disciplines the presentation timeline.
///
/// Exactly one source is active per session; the selection is made at
/// construction and never changes for the session's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    /// Audio playback position drives presentation (default).
    AudioMaster,
    /// Video presentation timestamps drive presentation.
    VideoMaster,
    /// Wall-clock elapsed time since session start drives presentation.
    ExternalClock,
}

/// What the host is asked to present when the source has no video track.
///
/// Does not affect synchronization math, only which surface is negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowMode {
    /// No visual surface is requested.
    None,
    /// Regular video frames.
    Video,
    /// Audio waveform visualization.
    Waveform,
    /// Spectrum visualization.
    SpectrumView,
}

/// Sample format of decoded audio handed to the pull buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// Signed 16-bit interleaved (the format the pull buffer stores).
    S16,
}

impl SampleFormat {
    /// Bytes per single (mono) sample.
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::S16 => 2,
        }
    }
}

/// Target refill cadence used to derive the per-callback buffer-size hint.
const AUDIO_CALLBACKS_PER_SEC: u32 = 30;

/// Negotiated audio device parameters.
///
/// Produced once per session by the host through the handler contract and
/// immutable after negotiation succeeds.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioParams {
    /// Channel layout bitmask (one bit per speaker position).
    pub channel_layout: i64,
    /// Number of interleaved channels.
    pub channels: u16,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Sample format.
    pub format: SampleFormat,
    /// Derived per-callback byte budget.
    pub buffer_size: usize,
}

impl AudioParams {
    /// Creates params and derives the buffer-size hint: the next power of two
    /// of one refill period's worth of frames, in bytes.
    pub fn new(channel_layout: i64, channels: u16, sample_rate: u32, format: SampleFormat) -> Self {
        let frames_per_cb =
            (sample_rate / AUDIO_CALLBACKS_PER_SEC).max(1).next_power_of_two() as usize;
        let buffer_size = frames_per_cb * channels as usize * format.bytes_per_sample();
        Self {
            channel_layout,
            channels,
            sample_rate,
            format,
            buffer_size,
        }
    }

    /// Returns true if the params describe a usable output configuration.
    pub fn is_usable(&self) -> bool {
        self.channels > 0 && self.sample_rate > 0
    }
}

/// Discards a channel layout whose population count disagrees with the
/// channel count. Returns 0 (unknown layout) on mismatch.
pub fn valid_channel_layout(channel_layout: i64, channels: u16) -> i64 {
    if channel_layout != 0 && channel_layout.count_ones() == u32::from(channels) {
        channel_layout
    } else {
        0
    }
}

/// Pixel format for decoded video frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUV 4:2:0 planar (most common video format)
    Yuv420p,
    /// NV12 (Y plane + interleaved UV, common for hardware decoders)
    Nv12,
    /// RGB 24-bit
    Rgb24,
    /// RGBA 32-bit
    Rgba,
    /// BGRA 32-bit
    Bgra,
}

/// Geometry of a negotiated or decoded video surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoGeometry {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel format.
    pub pixel_format: PixelFormat,
    /// Pixel (sample) aspect ratio, 1.0 for square pixels.
    pub sample_aspect_ratio: f32,
}

impl VideoGeometry {
    /// Display aspect ratio of the surface.
    pub fn aspect_ratio(&self) -> f32 {
        if self.height == 0 {
            return 1.0;
        }
        (self.width as f32 / self.height as f32) * self.sample_aspect_ratio
    }
}

/// Decoded interleaved audio samples with their presentation timestamp.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Interleaved signed 16-bit samples.
    pub samples: Vec<i16>,
    /// Presentation timestamp of the first sample, in seconds.
    pub pts: f64,
}

/// A decoded video frame as seen by the synchronization core.
///
/// Pixel payload stays inside the decode library and the host compositor;
/// the core only needs geometry and timing.
#[derive(Debug, Clone, Copy)]
pub struct VideoFrameInfo {
    /// Surface geometry of this frame.
    pub geometry: VideoGeometry,
    /// Presentation timestamp in seconds.
    pub pts: f64,
}

/// One unit of decoded output from the media library.
#[derive(Debug, Clone)]
pub enum MediaChunk {
    /// Decoded audio samples.
    Audio(AudioChunk),
    /// A decoded video frame.
    Video(VideoFrameInfo),
}

/// Audio track description reported by the decoder after open.
#[derive(Debug, Clone, Copy)]
pub struct AudioTrackInfo {
    /// Source channel layout bitmask (0 if unknown).
    pub channel_layout: i64,
    /// Source channel count.
    pub channels: u16,
    /// Source sample rate in Hz.
    pub sample_rate: u32,
}

/// Video track description reported by the decoder after open.
#[derive(Debug, Clone, Copy)]
pub struct VideoTrackInfo {
    /// Initial surface geometry.
    pub geometry: VideoGeometry,
    /// Nominal frame rate in frames per second.
    pub frame_rate: f64,
}

impl VideoTrackInfo {
    /// Nominal frame period, falling back to ~25fps for unknown rates.
    pub fn frame_period(&self) -> Duration {
        if self.frame_rate > 0.0 && self.frame_rate.is_finite() {
            Duration::from_secs_f64(1.0 / self.frame_rate)
        } else {
            Duration::from_millis(40)
        }
    }
}

/// Opaque demux/decode tuning dictionaries.
///
/// Keys and values are defined by the external decode library; the core
/// forwards them verbatim and never interprets their contents.
#[derive(Debug, Clone, Default)]
pub struct PlaybackOptions {
    /// Demuxer (format) options.
    pub format: HashMap<String, String>,
    /// Codec options.
    pub codec: HashMap<String, String>,
    /// Resampler options.
    pub resampler: HashMap<String, String>,
    /// Scaler options.
    pub scaler: HashMap<String, String>,
}

/// The decode-library boundary.
///
/// Implemented by the external media library adapter. The core drives it from
/// the decode/sync thread; implementations do not need to be thread-safe
/// beyond `Send`.
pub trait MediaDecoder: Send {
    /// Returns the next decoded chunk, or `None` when nothing is currently
    /// available (buffering, or end of stream once [`is_eof`] is true).
    ///
    /// [`is_eof`]: MediaDecoder::is_eof
    fn next_chunk(&mut self) -> Result<Option<MediaChunk>, PlaybackError>;

    /// The audio track description, if the source has one.
    fn audio_track(&self) -> Option<AudioTrackInfo>;

    /// The video track description, if the source has one.
    fn video_track(&self) -> Option<VideoTrackInfo>;

    /// True once the decoder has reached end of stream.
    ///
    /// More reliable than counting `None` results from [`next_chunk`], which
    /// can also mean a buffering gap.
    ///
    /// [`next_chunk`]: MediaDecoder::next_chunk
    fn is_eof(&self) -> bool {
        false
    }
}
