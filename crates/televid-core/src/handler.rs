//! The capability contracts a host implements for a playback session.

use std::time::Duration;

use crate::media::{AudioParams, PlaybackError, VideoGeometry};

/// The handler contract: capabilities the host supplies to a session.
///
/// The handler is owned by the host and shared with the session for its
/// lifetime. Negotiation calls happen once, during session startup, on the
/// session thread; notifications may arrive from the session thread at any
/// point before the terminal quit.
pub trait Handler: Send + Sync {
    /// Supplies the audio device parameters for this session.
    ///
    /// `wanted_*` describe the source; the host answers with what the device
    /// actually provides. Returning an error (or unusable params) terminates
    /// the session during negotiation.
    fn request_audio_params(
        &self,
        stream_ref: &str,
        wanted_channel_layout: i64,
        wanted_channels: u16,
        wanted_sample_rate: u32,
    ) -> Result<AudioParams, PlaybackError>;

    /// Mixes `src` into `dest` at the given linear volume (0..=100).
    ///
    /// Called during the audio pull; must not block and must saturate rather
    /// than wrap. Hosts without their own mixer can delegate to
    /// [`crate::audio_buffer::mix_audio_s16`].
    fn mix_audio(&self, dest: &mut [u8], src: &[u8], volume: u8);

    /// Asks the host to provide a video surface of the given geometry.
    fn request_video(
        &self,
        stream_ref: &str,
        geometry: &VideoGeometry,
    ) -> Result<(), PlaybackError>;

    /// Notifies the host that the decoded geometry changed mid-stream.
    fn notify_frame_resize(&self, stream_ref: &str, geometry: &VideoGeometry);

    /// Terminal notification. Called exactly once per session.
    fn notify_quit(&self, stream_ref: &str, exit_code: i32, error: Option<&PlaybackError>);
}

/// Process-wide timer registration the host may expose.
///
/// The core calls these but never owns the timer machinery; hosts without
/// timers simply don't pass an implementation anywhere.
pub trait TimerHost: Send + Sync {
    /// Registers a repeating timer with the given id.
    fn add_timer(&self, id: u64, interval: Duration);
    /// Removes a previously registered timer.
    fn remove_timer(&self, id: u64);
}
