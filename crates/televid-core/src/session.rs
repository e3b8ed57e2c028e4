//! Stream session lifecycle and the decode/sync loop.
//!
//! [`StreamEngine`] owns one playback session end-to-end: it probes the
//! source with an interruptible fetch, opens the decoder through the
//! host-supplied factory, negotiates audio/video parameters via the
//! [`Handler`] contract, then runs the decode/sync loop that routes audio
//! into the pull buffer and makes per-frame presentation timing decisions
//! against the master clock.
//!
//! # State Machine
//!
//! ```text
//! start()          → Created → Negotiating
//! negotiation ok   → Running
//! negotiation fail → Stopped  (one StreamQuit with the error)
//! abort()          → Aborting → Stopped
//! EOS / error      → Stopped
//! ```
//!
//! `StreamQuit` is posted exactly once per session, even under concurrent
//! abort requests; the session thread is joined before the engine is
//! released.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::audio_buffer::{AudioPullBuffer, PullBufferConfig};
use crate::clock::ClockModel;
use crate::events::{EventBus, EventPayload};
use crate::fetch::{fetch, QuitToken, DEFAULT_PROBE_LIMIT};
use crate::handler::Handler;
use crate::media::{
    valid_channel_layout, ClockSource, MediaChunk, MediaDecoder, PixelFormat, PlaybackError,
    PlaybackOptions, ShowMode, VideoFrameInfo, VideoGeometry, VideoTrackInfo,
};
use crate::sync_metrics::SyncMetrics;

/// Exit code for a clean stop or a cooperative abort.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code for a session terminated by an error.
pub const EXIT_FAILURE: i32 = 1;

/// Surface geometry requested for waveform/spectrum visualization when the
/// source has no video track.
const VIS_GEOMETRY: VideoGeometry = VideoGeometry {
    width: 640,
    height: 480,
    pixel_format: PixelFormat::Rgba,
    sample_aspect_ratio: 1.0,
};

/// Lifecycle state of a stream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Constructed; no decode activity yet.
    Created = 0,
    /// Querying the handler for audio/video parameters.
    Negotiating = 1,
    /// Decode, clock updates, and presentation decisions in progress.
    Running = 2,
    /// Abort requested; winding down cooperatively.
    Aborting = 3,
    /// Terminal. `StreamQuit` has been posted.
    Stopped = 4,
}

impl SessionState {
    fn from_u8(v: u8) -> SessionState {
        match v {
            0 => SessionState::Created,
            1 => SessionState::Negotiating,
            2 => SessionState::Running,
            3 => SessionState::Aborting,
            _ => SessionState::Stopped,
        }
    }
}

/// Timing policy for the presentation scheduler.
#[derive(Debug, Clone)]
pub struct SyncTuning {
    /// Maximum lateness a frame may have and still be shown without waiting.
    /// Frames later than this are dropped to avoid visible freezes.
    pub max_catchup: Duration,
    /// Early-wait budget in nominal frame periods before the master clock is
    /// resynchronized to the pending frame instead of stalling.
    pub desync_threshold_periods: f64,
    /// Upper bound of a single early-wait sleep slice; the abort flag is
    /// rechecked between slices.
    pub early_sleep_cap: Duration,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            max_catchup: Duration::from_millis(100),
            desync_threshold_periods: 10.0,
            early_sleep_cap: Duration::from_millis(10),
        }
    }
}

/// Everything needed to start a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Stream identifier; the external key other subsystems correlate on.
    pub stream_id: String,
    /// Source locator (URI or path).
    pub locator: String,
    /// Master clock discipline. Immutable for the session's lifetime.
    pub clock_source: ClockSource,
    /// Presentation surface policy when no video track exists.
    pub show_mode: ShowMode,
    /// Initial linear volume (0..=100) for hosts using the reference driver.
    pub volume: u8,
    /// Opaque demux/decode tuning forwarded to the decode library.
    pub options: PlaybackOptions,
    /// Presentation timing policy.
    pub tuning: SyncTuning,
    /// Sample ring sizing for the pull buffer.
    pub pull_buffer: PullBufferConfig,
}

impl SessionConfig {
    /// Config with defaults: audio-master clock, video show mode, full volume.
    pub fn new(stream_id: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            locator: locator.into(),
            clock_source: ClockSource::AudioMaster,
            show_mode: ShowMode::Video,
            volume: 100,
            options: PlaybackOptions::default(),
            tuning: SyncTuning::default(),
            pull_buffer: PullBufferConfig::default(),
        }
    }
}

/// The probe handed to the decoder factory: locator plus the fetched head.
#[derive(Debug, Clone)]
pub struct MediaProbe {
    /// The validated source locator.
    pub locator: String,
    /// Head bytes of the resource for container/codec detection.
    pub head: Bytes,
}

/// Opens the external decode library for a probed source.
pub type DecoderFactory = Box<
    dyn FnOnce(MediaProbe, &PlaybackOptions) -> Result<Box<dyn MediaDecoder>, PlaybackError>
        + Send,
>;

// =============================================================================
// Session registry
// =============================================================================

/// Running-session registry. At most one session may be Running against a
/// given stream identifier; collisions are rejected, never overwritten.
fn registry() -> &'static Mutex<HashSet<String>> {
    static REGISTRY: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashSet::new()))
}

/// A claimed stream identifier; released on drop.
struct RegistryClaim {
    stream_id: String,
}

impl RegistryClaim {
    fn claim(stream_id: &str) -> Result<Self, PlaybackError> {
        let mut ids = registry().lock();
        if !ids.insert(stream_id.to_string()) {
            return Err(PlaybackError::InvalidInput(format!(
                "stream '{stream_id}' already has a running session"
            )));
        }
        Ok(Self {
            stream_id: stream_id.to_string(),
        })
    }
}

impl Drop for RegistryClaim {
    fn drop(&mut self) {
        registry().lock().remove(&self.stream_id);
    }
}

// =============================================================================
// Audio pull callback
// =============================================================================

/// The pull entry point handed to the host's audio subsystem.
///
/// Fills the destination exactly, routing available samples through the
/// handler's mixer and padding the deficit with silence. Advancing the audio
/// clock is a side effect of the underlying buffer pull.
pub struct AudioCallback {
    buffer: Arc<AudioPullBuffer>,
    handler: Arc<dyn Handler>,
    stream_id: String,
    scratch: Vec<u8>,
}

impl AudioCallback {
    /// Pulls exactly `dest.len()` bytes at the given linear volume (0..=100).
    /// Returns the number of real (non-silence) bytes mixed in. Never blocks.
    pub fn pull(&mut self, dest: &mut [u8], volume: u8) -> usize {
        if self.scratch.len() < dest.len() {
            self.scratch.resize(dest.len(), 0);
        }
        let n = self.buffer.pull_raw(&mut self.scratch[..dest.len()]);
        dest.fill(0);
        if n > 0 {
            self.handler
                .mix_audio(&mut dest[..n], &self.scratch[..n], volume);
        }
        n
    }

    /// Stream identifier of the owning session.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }
}

// =============================================================================
// Stream engine
// =============================================================================

/// Shared state between the engine handle and the session thread.
struct SessionShared {
    stream_id: String,
    state: AtomicU8,
    abort: AtomicBool,
    quit_posted: AtomicBool,
    quit_token: QuitToken,
    clock: Arc<ClockModel>,
    buffer: Arc<AudioPullBuffer>,
    handler: Arc<dyn Handler>,
    bus: EventBus,
    metrics: SyncMetrics,
    volume: AtomicU8,
}

impl SessionShared {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Forward-only state store: Negotiating/Running never overwrite
    /// Aborting/Stopped; Stopped is terminal.
    fn advance_state(&self, new: SessionState) {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            let c = SessionState::from_u8(cur);
            if c == SessionState::Stopped {
                return;
            }
            if matches!(new, SessionState::Negotiating | SessionState::Running)
                && c == SessionState::Aborting
            {
                return;
            }
            match self.state.compare_exchange_weak(
                cur,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    tracing::debug!("session '{}': {c:?} -> {new:?}", self.stream_id);
                    return;
                }
                Err(v) => cur = v,
            }
        }
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }
}

/// Owns one playback session end-to-end.
pub struct StreamEngine {
    shared: Arc<SessionShared>,
    thread: Option<JoinHandle<()>>,
}

impl StreamEngine {
    /// Starts a session: claims the stream id, spawns the session thread, and
    /// returns immediately. Progress and termination are reported through the
    /// event queue and the handler.
    ///
    /// Fails with `InvalidInput` when the stream id is empty or a session is
    /// already running against it (no `StreamQuit` is posted in that case —
    /// the session never existed).
    pub fn start(
        config: SessionConfig,
        handler: Arc<dyn Handler>,
        bus: EventBus,
        factory: DecoderFactory,
    ) -> Result<Self, PlaybackError> {
        if config.stream_id.is_empty() {
            return Err(PlaybackError::InvalidInput("empty stream id".into()));
        }
        let claim = RegistryClaim::claim(&config.stream_id)?;

        let clock = Arc::new(ClockModel::new(config.clock_source));
        let buffer = Arc::new(AudioPullBuffer::new(
            config.pull_buffer.clone(),
            Arc::clone(&clock),
        ));

        let shared = Arc::new(SessionShared {
            stream_id: config.stream_id.clone(),
            state: AtomicU8::new(SessionState::Created as u8),
            abort: AtomicBool::new(false),
            quit_posted: AtomicBool::new(false),
            quit_token: QuitToken::new(),
            clock,
            buffer,
            handler,
            bus,
            metrics: SyncMetrics::new(),
            volume: AtomicU8::new(config.volume.min(100)),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(format!("televid-session-{}", config.stream_id))
            .spawn(move || run_session(thread_shared, config, factory, claim))
            .map_err(|e| PlaybackError::Io(format!("spawn session thread: {e}")))?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Stream identifier of this session.
    pub fn stream_id(&self) -> &str {
        &self.shared.stream_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// The session clock model.
    pub fn clock(&self) -> &Arc<ClockModel> {
        &self.shared.clock
    }

    /// Presentation sync metrics.
    pub fn sync_metrics(&self) -> &SyncMetrics {
        &self.shared.metrics
    }

    /// Creates the pull entry point for the host's audio subsystem.
    pub fn audio_callback(&self) -> AudioCallback {
        AudioCallback {
            buffer: Arc::clone(&self.shared.buffer),
            handler: Arc::clone(&self.shared.handler),
            stream_id: self.shared.stream_id.clone(),
            scratch: Vec::new(),
        }
    }

    /// Current linear volume (0..=100).
    pub fn volume(&self) -> u8 {
        self.shared.volume.load(Ordering::Relaxed)
    }

    /// Sets the linear volume used by the reference output driver.
    pub fn set_volume(&self, volume: u8) {
        self.shared.volume.store(volume.min(100), Ordering::Relaxed);
    }

    /// Requests a cooperative abort. Idempotent: repeated or concurrent calls
    /// terminate the session once, with the same exit code.
    ///
    /// The abort flag is observed by the decode/sync loop at iteration
    /// boundaries and by the fetch quit predicate; no thread is forcibly
    /// terminated.
    pub fn abort(&self) {
        if !self.shared.abort.swap(true, Ordering::AcqRel) {
            tracing::info!("abort requested for session '{}'", self.shared.stream_id);
        }
        self.shared.quit_token.request_quit();

        let mut cur = self.shared.state.load(Ordering::Acquire);
        loop {
            match SessionState::from_u8(cur) {
                SessionState::Aborting | SessionState::Stopped => return,
                _ => {}
            }
            match self.shared.state.compare_exchange_weak(
                cur,
                SessionState::Aborting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(v) => cur = v,
            }
        }
    }

    /// Waits for the session thread to finish. The state is `Stopped` and
    /// the terminal event has been posted when this returns.
    pub fn join(mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        if self.shared.state() != SessionState::Stopped {
            self.abort();
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

// =============================================================================
// Session thread
// =============================================================================

fn exit_code_for(error: &PlaybackError) -> i32 {
    match error {
        PlaybackError::Aborted => EXIT_SUCCESS,
        _ => EXIT_FAILURE,
    }
}

fn run_session(
    shared: Arc<SessionShared>,
    config: SessionConfig,
    factory: DecoderFactory,
    claim: RegistryClaim,
) {
    shared.advance_state(SessionState::Negotiating);

    let established = establish(&shared, &config, factory);
    let (exit_code, error) = match established {
        Err(e) => (exit_code_for(&e), Some(e)),
        Ok((decoder, video_track)) => {
            shared.advance_state(SessionState::Running);
            match run_loop(&shared, &config, decoder, video_track) {
                Ok(()) => (EXIT_SUCCESS, None),
                Err(e) => (exit_code_for(&e), Some(e)),
            }
        }
    };

    finish(&shared, claim, exit_code, error);
}

/// Probes the source, opens the decoder, and negotiates device parameters.
fn establish(
    shared: &Arc<SessionShared>,
    config: &SessionConfig,
    factory: DecoderFactory,
) -> Result<(Box<dyn MediaDecoder>, Option<VideoTrackInfo>), PlaybackError> {
    // Short-lived interruptible fetch thread; the quit token doubles as the
    // abort hook so an aborting session never hangs on network I/O.
    let head = {
        let locator = config.locator.clone();
        let fetch_shared = Arc::clone(shared);
        let handle = thread::Builder::new()
            .name("televid-fetch".into())
            .spawn(move || fetch(&locator, &fetch_shared.quit_token, DEFAULT_PROBE_LIMIT))
            .map_err(|e| PlaybackError::Io(format!("spawn fetch thread: {e}")))?;
        handle
            .join()
            .map_err(|_| PlaybackError::Unreachable("fetch thread panicked".into()))??
    };

    let probe = MediaProbe {
        locator: config.locator.clone(),
        head,
    };
    let decoder = factory(probe, &config.options)?;

    if shared.aborted() {
        return Err(PlaybackError::Aborted);
    }

    // Audio negotiation comes first: a session that cannot produce sound has
    // no business requesting a surface.
    if let Some(track) = decoder.audio_track() {
        let layout = valid_channel_layout(track.channel_layout, track.channels);
        let params = shared.handler.request_audio_params(
            &shared.stream_id,
            layout,
            track.channels,
            track.sample_rate,
        )?;
        if !params.is_usable() {
            return Err(PlaybackError::Negotiation(format!(
                "unusable audio params: {} ch @ {} Hz",
                params.channels, params.sample_rate
            )));
        }
        tracing::info!(
            "session '{}': audio negotiated {} ch @ {} Hz (buffer hint {} bytes)",
            shared.stream_id,
            params.channels,
            params.sample_rate,
            params.buffer_size
        );
        shared.buffer.configure(&params);
    } else if config.clock_source == ClockSource::AudioMaster {
        tracing::warn!(
            "session '{}': no audio track; audio-master clock starts from first frame",
            shared.stream_id
        );
    }

    // Video surface negotiation, or a visualization surface per ShowMode.
    let video_track = decoder.video_track();
    let surface = match video_track {
        Some(track) => Some(track.geometry),
        None if config.show_mode != ShowMode::None && decoder.audio_track().is_some() => {
            Some(VIS_GEOMETRY)
        }
        None => None,
    };
    if let Some(geometry) = surface {
        shared.handler.request_video(&shared.stream_id, &geometry)?;
        shared.bus.post(EventPayload::FrameRequest {
            stream_ref: shared.stream_id.clone(),
            geometry,
        });
    }

    Ok((decoder, video_track))
}

/// The decode/sync loop: routes audio to the pull buffer, times video frames
/// against the master clock, detects geometry changes.
fn run_loop(
    shared: &Arc<SessionShared>,
    config: &SessionConfig,
    mut decoder: Box<dyn MediaDecoder>,
    video_track: Option<VideoTrackInfo>,
) -> Result<(), PlaybackError> {
    let serial = shared.clock.serial();
    let frame_period = video_track
        .as_ref()
        .map(|t| t.frame_period())
        .unwrap_or(Duration::from_millis(40));
    let desync_threshold = frame_period.as_secs_f64() * config.tuning.desync_threshold_periods;
    let mut current_geometry = video_track.as_ref().map(|t| t.geometry);

    loop {
        if shared.aborted() {
            tracing::info!("session '{}': abort observed in decode loop", shared.stream_id);
            return Ok(());
        }

        match decoder.next_chunk()? {
            None => {
                if decoder.is_eof() {
                    tracing::info!("session '{}': end of stream", shared.stream_id);
                    return Ok(());
                }
                // Buffering gap
                thread::sleep(Duration::from_millis(10));
            }
            Some(MediaChunk::Audio(chunk)) => {
                shared.buffer.write(&chunk.samples, chunk.pts);

                // The ring overwrites on overflow, so the producer throttles
                // itself: comfortable fill sleeps a frame's worth, low fill
                // decodes at full speed.
                let fill = shared.buffer.fill_level();
                let cap = shared.buffer.capacity();
                if fill > cap / 2 {
                    thread::sleep(Duration::from_millis(20));
                } else if fill > cap / 4 {
                    thread::sleep(Duration::from_millis(5));
                }
            }
            Some(MediaChunk::Video(frame)) => {
                if let Some(current) = current_geometry {
                    if frame.geometry != current {
                        tracing::info!(
                            "session '{}': geometry change {}x{} -> {}x{}",
                            shared.stream_id,
                            current.width,
                            current.height,
                            frame.geometry.width,
                            frame.geometry.height
                        );
                        shared
                            .handler
                            .notify_frame_resize(&shared.stream_id, &frame.geometry);
                        shared.bus.post(EventPayload::FrameResize {
                            stream_ref: shared.stream_id.clone(),
                            geometry: frame.geometry,
                        });
                        current_geometry = Some(frame.geometry);
                    }
                } else {
                    current_geometry = Some(frame.geometry);
                }

                present_or_drop(shared, &config.tuning, desync_threshold, serial, &frame);
            }
        }
    }
}

/// Per-frame timing triage: early frames wait (bounded, abort-aware),
/// on-time frames present, frames late beyond the catch-up window drop.
fn present_or_drop(
    shared: &Arc<SessionShared>,
    tuning: &SyncTuning,
    desync_threshold: f64,
    serial: u64,
    frame: &VideoFrameInfo,
) {
    let clock = &shared.clock;

    // First frame before the master has started: seed the master from it so
    // playback begins immediately instead of chasing an idle clock.
    if !clock.master_started() {
        clock.resync_master(frame.pts, serial);
        clock.advance_video(frame.pts, serial);
        shared.metrics.record_frame(frame.pts, clock.master_time());
        return;
    }

    let mut waited = 0.0f64;
    loop {
        if shared.aborted() {
            return;
        }
        let early = frame.pts - clock.master_time();
        if early <= 0.0 {
            break;
        }
        if waited > desync_threshold {
            tracing::warn!(
                "session '{}': early wait exceeded desync threshold ({:.0}ms), resyncing master",
                shared.stream_id,
                desync_threshold * 1000.0
            );
            clock.resync_master(frame.pts, serial);
            break;
        }
        let nap = early.min(tuning.early_sleep_cap.as_secs_f64());
        thread::sleep(Duration::from_secs_f64(nap));
        waited += nap;
    }

    let master = clock.master_time();
    let lateness = master - frame.pts;
    if lateness > tuning.max_catchup.as_secs_f64() {
        shared.metrics.record_drop();
        tracing::debug!(
            "session '{}': dropping frame pts={:.3}s ({}ms late)",
            shared.stream_id,
            frame.pts,
            (lateness * 1000.0) as i64
        );
        return;
    }

    clock.advance_video(frame.pts, serial);
    shared.metrics.record_frame(frame.pts, master);
}

/// Terminal path. Runs exactly once per session: posts `StreamQuit`, notifies
/// the handler, releases the registry claim.
fn finish(
    shared: &Arc<SessionShared>,
    claim: RegistryClaim,
    exit_code: i32,
    error: Option<PlaybackError>,
) {
    if shared.quit_posted.swap(true, Ordering::AcqRel) {
        return;
    }

    shared.advance_state(SessionState::Stopped);
    match &error {
        Some(e) => tracing::info!(
            "session '{}' stopped: exit {exit_code} ({e})",
            shared.stream_id
        ),
        None => tracing::info!("session '{}' stopped: exit {exit_code}", shared.stream_id),
    }

    shared
        .handler
        .notify_quit(&shared.stream_id, exit_code, error.as_ref());
    shared.bus.post(EventPayload::StreamQuit {
        stream_ref: shared.stream_id.clone(),
        exit_code,
        error,
    });

    drop(claim);
}
