//! Interruptible media resource fetching.
//!
//! Opening a remote stream can block inside network I/O for a long time; an
//! aborting session must never hang on it. The fetcher validates the locator
//! before any I/O is attempted, then reads the resource head in chunks,
//! polling a quit predicate at every I/O boundary — the granularity the
//! decode library provides. Finer-grained preemption is not assumed.
//!
//! The cancellation state is a [`QuitToken`]: single owner, released exactly
//! once, either when the interrupt fires or on normal teardown. Transport for
//! non-file schemes belongs to the external decode library; the bundled
//! opener handles `file://` URLs and plain paths, which is all the probe
//! path needs.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use url::Url;

use crate::media::PlaybackError;

/// Default probe limit: enough head data for container/codec detection.
pub const DEFAULT_PROBE_LIMIT: usize = 256 * 1024;

/// One read syscall's worth of data; the quit predicate is polled per chunk.
const READ_CHUNK: usize = 8 * 1024;

/// Single-owner cancellation state for a fetch in flight.
///
/// `request_quit` may be called from any thread; the fetch observes it at the
/// next I/O boundary. `release` is explicit and idempotent — the first caller
/// performs the release, later calls are no-ops — so the
/// interrupt path and the teardown path cannot double-release, and `Drop`
/// guarantees no leak.
#[derive(Debug, Default)]
pub struct QuitToken {
    quit: AtomicBool,
    released: AtomicBool,
}

impl QuitToken {
    /// Creates a token in the not-quit state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals the fetch to abort at its next poll.
    pub fn request_quit(&self) {
        self.quit.store(true, Ordering::Release);
    }

    /// The predicate the fetch polls.
    pub fn is_quit(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }

    /// Releases the cancellation state. Returns true for the caller that
    /// actually performed the release.
    pub fn release(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }

    /// True once the token has been released.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for QuitToken {
    fn drop(&mut self) {
        if self.release() {
            tracing::trace!("quit token released on drop");
        }
    }
}

/// Resolves a locator to a local path the bundled opener can read.
///
/// Fails with `InvalidInput` before any I/O when the locator is malformed;
/// non-file schemes are the decode library's transport and surface as `Io`.
fn resolve_locator(locator: &str) -> Result<PathBuf, PlaybackError> {
    if locator.trim().is_empty() {
        return Err(PlaybackError::InvalidInput("empty locator".into()));
    }
    if locator.contains('\0') {
        return Err(PlaybackError::InvalidInput(
            "locator contains NUL byte".into(),
        ));
    }

    match Url::parse(locator) {
        Ok(url) if url.scheme() == "file" => url.to_file_path().map_err(|_| {
            PlaybackError::InvalidInput(format!("file URL has no usable path: {locator}"))
        }),
        Ok(url) => Err(PlaybackError::Io(format!(
            "scheme '{}' is handled by the decode library transport",
            url.scheme()
        ))),
        // No scheme at all: treat as a plain filesystem path
        Err(url::ParseError::RelativeUrlWithoutBase) => Ok(PathBuf::from(locator)),
        Err(e) => Err(PlaybackError::InvalidInput(format!(
            "malformed locator '{locator}': {e}"
        ))),
    }
}

/// Fetches up to `limit` bytes of the resource head, polling `quit` at every
/// I/O boundary.
///
/// Errors: `InvalidInput` for a malformed locator (before any I/O), `Io` for
/// open/read failures, `Aborted` when the predicate signals quit
/// mid-operation. On abort the token is released by the interrupt path.
pub fn fetch(locator: &str, quit: &QuitToken, limit: usize) -> Result<Bytes, PlaybackError> {
    let path = resolve_locator(locator)?;

    if quit.is_quit() {
        quit.release();
        return Err(PlaybackError::Aborted);
    }

    let mut file = File::open(&path)
        .map_err(|e| PlaybackError::Io(format!("open {}: {e}", path.display())))?;

    let mut buf = Vec::with_capacity(limit.min(DEFAULT_PROBE_LIMIT));
    let mut chunk = [0u8; READ_CHUNK];
    while buf.len() < limit {
        if quit.is_quit() {
            quit.release();
            tracing::debug!("fetch aborted after {} bytes: {locator}", buf.len());
            return Err(PlaybackError::Aborted);
        }

        let want = READ_CHUNK.min(limit - buf.len());
        match file.read(&mut chunk[..want]) {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(PlaybackError::Io(format!("read {}: {e}", path.display()))),
        }
    }

    tracing::debug!("fetched {} probe bytes from {locator}", buf.len());
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(name: &str, contents: &[u8]) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("televid-fetch-{name}-{}", std::process::id()));
        let mut f = File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[test]
    fn test_empty_locator_is_invalid_input() {
        let quit = QuitToken::new();
        match fetch("", &quit, 1024) {
            Err(PlaybackError::InvalidInput(_)) => {}
            other => panic!("expected InvalidInput, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_url_is_invalid_input_before_io() {
        let quit = QuitToken::new();
        match fetch("http://", &quit, 1024) {
            Err(PlaybackError::InvalidInput(_)) => {}
            other => panic!("expected InvalidInput, got {other:?}"),
        }
    }

    #[test]
    fn test_unsupported_scheme_is_io() {
        let quit = QuitToken::new();
        match fetch("https://example.com/stream.ts", &quit, 1024) {
            Err(PlaybackError::Io(_)) => {}
            other => panic!("expected Io, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_file_is_io() {
        let quit = QuitToken::new();
        match fetch("/nonexistent/televid-test-file", &quit, 1024) {
            Err(PlaybackError::Io(_)) => {}
            other => panic!("expected Io, got {other:?}"),
        }
    }

    #[test]
    fn test_reads_probe_up_to_limit() {
        let path = temp_file("limit", &[0x42u8; 1000]);
        let quit = QuitToken::new();

        let head = fetch(path.to_str().unwrap(), &quit, 256).unwrap();
        assert_eq!(head.len(), 256);
        assert!(head.iter().all(|&b| b == 0x42));

        let all = fetch(path.to_str().unwrap(), &quit, 4096).unwrap();
        assert_eq!(all.len(), 1000);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_file_url_roundtrip() {
        let path = temp_file("url", b"moov");
        let locator = format!("file://{}", path.display());
        let quit = QuitToken::new();
        assert_eq!(&fetch(&locator, &quit, 64).unwrap()[..], b"moov");
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_quit_aborts_without_hanging() {
        let path = temp_file("abort", &[0u8; 64]);
        let quit = QuitToken::new();
        quit.request_quit();

        match fetch(path.to_str().unwrap(), &quit, 1024) {
            Err(PlaybackError::Aborted) => {}
            other => panic!("expected Aborted, got {other:?}"),
        }
        assert!(quit.is_released(), "interrupt path must release the token");
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_release_is_once() {
        let quit = QuitToken::new();
        assert!(quit.release());
        assert!(!quit.release(), "second release must be a no-op");
    }
}
