//! televid-core: playback-synchronization core for a television-streaming
//! client.
//!
//! Given demuxed audio and video elementary streams (decoding delegated to an
//! external media library behind [`media::MediaDecoder`]), this crate decides
//! when each audio chunk and video frame is presented so that picture and
//! sound stay perceptually aligned, and reports readiness, resize, and
//! termination to the host through an asynchronous event queue.
//!
//! - Core types and the decode boundary: [`media`]
//! - Presentation clocks and master discipline: [`clock`]
//! - Pull-based audio buffering: [`audio_buffer`]
//! - Interruptible resource fetching: [`fetch`]
//! - Event records and dispatch: [`events`]
//! - Host capability contracts: [`handler`]
//! - Session lifecycle and the decode/sync loop: [`session`]
//! - Drift instrumentation: [`sync_metrics`]
//!
//! This crate has **zero UI dependency**. Rendering, input, and pixel
//! composition belong to the host; the optional [`audio_output`] module
//! (feature `audio-output`) provides a cpal-backed reference pull driver.

pub mod audio_buffer;
pub mod clock;
pub mod events;
pub mod fetch;
pub mod handler;
pub mod media;
pub mod session;
pub mod sync_metrics;

#[cfg(feature = "audio-output")]
pub mod audio_output;

pub use audio_buffer::{mix_audio_s16, AudioPullBuffer, PullBufferConfig, VOLUME_MAX};
pub use clock::{ClockModel, StreamKind};
pub use events::{event_queue, Event, EventBus, EventConsumer, EventDrain, EventPayload};
pub use fetch::{fetch, QuitToken, DEFAULT_PROBE_LIMIT};
pub use handler::{Handler, TimerHost};
pub use media::{
    valid_channel_layout, AudioChunk, AudioParams, AudioTrackInfo, ClockSource, MediaChunk,
    MediaDecoder, PixelFormat, PlaybackError, PlaybackOptions, SampleFormat, ShowMode,
    VideoFrameInfo, VideoGeometry, VideoTrackInfo,
};
pub use session::{
    AudioCallback, DecoderFactory, MediaProbe, SessionConfig, SessionState, StreamEngine,
    SyncTuning, EXIT_FAILURE, EXIT_SUCCESS,
};
pub use sync_metrics::{SyncMetrics, SyncMetricsSnapshot, SYNC_DRIFT_THRESHOLD_MS};

#[cfg(feature = "audio-output")]
pub use audio_output::AudioOutput;
