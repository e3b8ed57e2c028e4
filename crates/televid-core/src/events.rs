//! Typed event records between the playback core and the host.
//!
//! Producers (the session thread, timers) post events from any context; the
//! host's main loop is the single consumer that drains and dispatches them.
//! The payload set is closed: a conforming dispatcher handles every variant
//! exhaustively, which the [`EventConsumer`] contract enforces at compile
//! time — there is no "unknown event" arm to reach at runtime.
//!
//! Every event is stamped with a monotonic creation timestamp in
//! milliseconds for latency diagnostics.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::media::{PlaybackError, VideoGeometry};

/// Milliseconds since the first event-clock use in this process.
fn monotonic_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Payload of an event. The set is closed by design.
#[derive(Debug, Clone)]
pub enum EventPayload {
    /// Video surface negotiation: the session asks the host for a surface of
    /// this geometry.
    FrameRequest {
        /// Stream identifier of the session.
        stream_ref: String,
        /// Requested surface geometry.
        geometry: VideoGeometry,
    },
    /// The decoded geometry changed mid-stream; the host must resize.
    FrameResize {
        /// Stream identifier of the session.
        stream_ref: String,
        /// New surface geometry.
        geometry: VideoGeometry,
    },
    /// Terminal notification: the session stopped. Posted exactly once.
    StreamQuit {
        /// Stream identifier of the session.
        stream_ref: String,
        /// Final exit code (0 = clean stop or cooperative abort).
        exit_code: i32,
        /// The error that ended the session, if any.
        error: Option<PlaybackError>,
    },
}

/// An event record: payload plus creation timestamp.
#[derive(Debug, Clone)]
pub struct Event {
    /// The typed payload.
    pub payload: EventPayload,
    /// Monotonic creation timestamp in milliseconds.
    pub created_ms: u64,
}

impl Event {
    /// Creates an event stamped with the current monotonic time.
    pub fn new(payload: EventPayload) -> Self {
        Self {
            payload,
            created_ms: monotonic_ms(),
        }
    }
}

/// The capability set a host dispatch loop implements.
pub trait EventConsumer {
    /// A session requests a video surface.
    fn on_frame_request(&mut self, event: &Event, stream_ref: &str, geometry: &VideoGeometry);
    /// A session's video geometry changed mid-stream.
    fn on_frame_resize(&mut self, event: &Event, stream_ref: &str, geometry: &VideoGeometry);
    /// A session terminated.
    fn on_stream_quit(
        &mut self,
        event: &Event,
        stream_ref: &str,
        exit_code: i32,
        error: Option<&PlaybackError>,
    );
}

/// Producer handle of the event queue. Cheap to clone; safe from any
/// producer context except the audio pull callback (enqueue may briefly
/// block on allocation).
#[derive(Clone)]
pub struct EventBus {
    tx: Sender<Event>,
}

/// Consumer half of the event queue. Owned by exactly one logical actor
/// (the host's dispatch loop) at a time.
pub struct EventDrain {
    rx: Receiver<Event>,
}

/// Creates a connected event queue.
pub fn event_queue() -> (EventBus, EventDrain) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (EventBus { tx }, EventDrain { rx })
}

impl EventBus {
    /// Enqueues an event. Ordering is FIFO per producer.
    pub fn post(&self, payload: EventPayload) {
        // Send fails only when the drain is gone; the session is shutting
        // down in that case and the event has no recipient.
        let _ = self.tx.send(Event::new(payload));
    }
}

impl EventDrain {
    /// Takes the next pending event without blocking.
    pub fn try_next(&self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Waits up to `timeout` for the next event.
    pub fn next_timeout(&self, timeout: Duration) -> Option<Event> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Dispatches all currently pending events to the consumer.
    /// Returns the number of events dispatched.
    pub fn dispatch_pending(&self, consumer: &mut dyn EventConsumer) -> usize {
        let mut dispatched = 0;
        while let Some(event) = self.try_next() {
            dispatch(&event, consumer);
            dispatched += 1;
        }
        dispatched
    }
}

/// Routes one event to the consumer. Exhaustive over the closed payload set.
pub fn dispatch(event: &Event, consumer: &mut dyn EventConsumer) {
    match &event.payload {
        EventPayload::FrameRequest {
            stream_ref,
            geometry,
        } => consumer.on_frame_request(event, stream_ref, geometry),
        EventPayload::FrameResize {
            stream_ref,
            geometry,
        } => consumer.on_frame_resize(event, stream_ref, geometry),
        EventPayload::StreamQuit {
            stream_ref,
            exit_code,
            error,
        } => consumer.on_stream_quit(event, stream_ref, *exit_code, error.as_ref()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::PixelFormat;

    fn geometry() -> VideoGeometry {
        VideoGeometry {
            width: 1280,
            height: 720,
            pixel_format: PixelFormat::Yuv420p,
            sample_aspect_ratio: 1.0,
        }
    }

    #[derive(Default)]
    struct Recorder {
        requests: Vec<String>,
        resizes: Vec<(u32, u32)>,
        quits: Vec<(String, i32)>,
    }

    impl EventConsumer for Recorder {
        fn on_frame_request(&mut self, _e: &Event, stream_ref: &str, _g: &VideoGeometry) {
            self.requests.push(stream_ref.to_string());
        }
        fn on_frame_resize(&mut self, _e: &Event, _s: &str, g: &VideoGeometry) {
            self.resizes.push((g.width, g.height));
        }
        fn on_stream_quit(
            &mut self,
            _e: &Event,
            stream_ref: &str,
            exit_code: i32,
            _error: Option<&PlaybackError>,
        ) {
            self.quits.push((stream_ref.to_string(), exit_code));
        }
    }

    #[test]
    fn test_creation_timestamps_non_decreasing() {
        let a = Event::new(EventPayload::FrameRequest {
            stream_ref: "s".into(),
            geometry: geometry(),
        });
        std::thread::sleep(Duration::from_millis(5));
        let b = Event::new(EventPayload::FrameRequest {
            stream_ref: "s".into(),
            geometry: geometry(),
        });
        assert!(b.created_ms >= a.created_ms);
    }

    #[test]
    fn test_dispatch_routes_by_payload() {
        let (bus, drain) = event_queue();
        bus.post(EventPayload::FrameRequest {
            stream_ref: "ch1".into(),
            geometry: geometry(),
        });
        bus.post(EventPayload::FrameResize {
            stream_ref: "ch1".into(),
            geometry: VideoGeometry {
                width: 1920,
                height: 1080,
                ..geometry()
            },
        });
        bus.post(EventPayload::StreamQuit {
            stream_ref: "ch1".into(),
            exit_code: 0,
            error: None,
        });

        let mut rec = Recorder::default();
        assert_eq!(drain.dispatch_pending(&mut rec), 3);
        assert_eq!(rec.requests, vec!["ch1"]);
        assert_eq!(rec.resizes, vec![(1920, 1080)]);
        assert_eq!(rec.quits, vec![("ch1".to_string(), 0)]);
    }

    #[test]
    fn test_multi_producer_single_consumer() {
        let (bus, drain) = event_queue();
        let mut handles = Vec::new();
        for t in 0..4 {
            let bus = bus.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..25 {
                    bus.post(EventPayload::FrameRequest {
                        stream_ref: format!("producer-{t}"),
                        geometry: geometry(),
                    });
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut rec = Recorder::default();
        assert_eq!(drain.dispatch_pending(&mut rec), 100);
    }

    #[test]
    fn test_next_timeout_returns_none_when_idle() {
        let (_bus, drain) = event_queue();
        assert!(drain.next_timeout(Duration::from_millis(10)).is_none());
    }
}
