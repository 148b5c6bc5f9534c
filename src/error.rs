//! Crate-wide error type.
//!
//! `mio` itself is content to return bare [`std::io::Error`] because it has
//! nothing more specific to say. This crate's public surface needs to tell a
//! caller "that UUID is stale" apart from "the kernel call failed", so the
//! error kinds of the specification are modeled as a real enum instead.

use std::io;

/// The distinct failure kinds the core can report.
#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    /// The supplied [`crate::Uuid`] does not match the fd slot's current
    /// generation (or the slot is closed).
    #[error("invalid uuid")]
    InvalidUuid,
    /// A non-blocking operation could not complete immediately.
    #[error("operation would block")]
    WouldBlock,
    /// The connection was already closed.
    #[error("connection closed")]
    ConnectionClosed,
    /// The host allocator refused a request. This kind is only ever
    /// observed through [`Error::kind`] on the way to a process abort -
    /// spec.md §7 treats allocation failure as fatal.
    #[error("allocation failure")]
    AllocFail,
    /// A bounded buffer (e.g. a cluster IPC frame, a chunked `sendfile`
    /// fallback copy) could not hold the requested data.
    #[error("buffer full")]
    BufferFull,
    /// Sending or receiving a cluster IPC frame failed.
    #[error("cluster ipc failure")]
    ClusterIpcFailure,
    /// The OS poller reported an error unrelated to a specific fd.
    #[error("poller failure")]
    PollerFailure,
    /// A pub/sub pattern string was malformed.
    #[error("invalid pattern")]
    PatternInvalid,
}

/// The crate's error type: a [`ErrorKind`] plus, when the failure
/// originated in the kernel, the underlying [`io::Error`].
#[derive(Debug, thiserror::Error)]
#[error("{kind}")]
pub struct Error {
    kind: ErrorKind,
    #[source]
    source: Option<io::Error>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error { kind, source: None }
    }

    pub fn with_io(kind: ErrorKind, source: io::Error) -> Self {
        Error {
            kind,
            source: Some(source),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// `true` for [`ErrorKind::WouldBlock`], including when it was derived
    /// from an `io::Error` whose kind is `io::ErrorKind::WouldBlock`.
    pub fn is_would_block(&self) -> bool {
        matches!(self.kind, ErrorKind::WouldBlock)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let kind = if err.kind() == io::ErrorKind::WouldBlock {
            ErrorKind::WouldBlock
        } else {
            ErrorKind::PollerFailure
        };
        Error::with_io(kind, err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
