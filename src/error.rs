//! Error types for the event socket engine

use std::io;
use std::time::Duration;

use crate::event::Event;

/// Convenience result alias used throughout the crate.
pub type EslResult<T> = Result<T, EslError>;

/// Errors surfaced by the connection and endpoint APIs.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EslError {
    /// Underlying transport I/O failure, fatal to the connection.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The connection has torn down; pending and future operations fail with this.
    #[error("connection closed")]
    ConnectionClosed,

    /// A command reply or background job did not arrive within the caller's deadline.
    /// Local to the waiting call; the connection stays up.
    #[error("timed out after {timeout:?} waiting for reply")]
    Timeout { timeout: Duration },

    /// The authentication handshake was rejected.
    #[error("authentication failed: {reply}")]
    AuthFailed { reply: String },

    /// A frame could not be parsed. Carries the best-effort partial event.
    #[error(transparent)]
    Framing(#[from] FrameError),

    /// The peer violated the protocol outside of frame parsing.
    #[error("protocol error: {message}")]
    Protocol { message: String },
}

impl EslError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        EslError::Protocol {
            message: message.into(),
        }
    }
}

/// A frame-level parse failure.
///
/// The parser never discards partial state: `event` holds everything parsed
/// before the failure (headers read so far, and for short reads a body buffer
/// allocated at the declared length with the received prefix filled in).
#[derive(Debug)]
pub struct FrameError {
    /// Best-effort partial event. Never absent, possibly empty.
    pub event: Event,
    /// What went wrong.
    pub kind: FrameErrorKind,
}

impl FrameError {
    pub(crate) fn new(event: Event, kind: FrameErrorKind) -> Self {
        Self { event, kind }
    }
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.kind.fmt(f)
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

/// Classification of frame parse failures.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FrameErrorKind {
    /// Content-Length did not parse as a non-negative integer.
    #[error("invalid Content-Length header: {0:?}")]
    InvalidContentLength(String),

    /// Content-Length exceeded the sanity limit.
    #[error("declared body length {declared} exceeds limit {limit}")]
    OversizedBody { declared: usize, limit: usize },

    /// The stream ended before the declared body length was read.
    #[error("unexpected end of stream: {0}")]
    UnexpectedEof(#[source] io::Error),

    /// A header line had no colon separator.
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),

    /// The transport failed mid-frame.
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

impl FrameErrorKind {
    /// Whether the stream can still be assumed frame-aligned after this error.
    ///
    /// A bad length or a truncated body means the next read would start at an
    /// arbitrary offset, so the connection must close.
    /// A malformed header line inside a well-delimited header block leaves the
    /// stream aligned; everything else does not.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FrameErrorKind::MalformedHeader(_))
    }
}
