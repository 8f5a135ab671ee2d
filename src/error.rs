//! Crate-wide error taxonomy.
//!
//! Transport and timeout failures surface to the original caller through a
//! [`Call`](crate::call::Call)'s failure path; protocol and decode errors are
//! recovered locally (logged and skipped) since they cannot be attributed to
//! a specific caller.

use std::io;

use thiserror::Error;

/// Errors produced by the transport engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket or channel failure. Always terminal for the affected connection.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    /// TLS record-layer or handshake failure.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    /// Peer certificate missing, malformed, or outside its validity window.
    #[error("certificate error: {0}")]
    Certificate(String),
    /// Malformed frame or unrecognized command.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A request with the same correlation id is already in flight.
    #[error("request with the same id is already in flight")]
    DuplicateRequest,
    /// A synchronous wait elapsed before the call completed.
    #[error("timed out waiting for response")]
    WaitTimeout,
    /// The connection was closed before or during the operation.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
    /// Connection-level failure reported by the peer or the runtime.
    #[error("connection failure: {0}")]
    Connection(String),
    /// Payload bytes could not be decoded by the payload codec.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Discriminant of [`Error`], used by retry allowlists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// See [`Error::Transport`].
    Transport,
    /// See [`Error::Tls`].
    Tls,
    /// See [`Error::Certificate`].
    Certificate,
    /// See [`Error::Protocol`].
    Protocol,
    /// See [`Error::DuplicateRequest`].
    DuplicateRequest,
    /// See [`Error::WaitTimeout`].
    WaitTimeout,
    /// See [`Error::ConnectionClosed`].
    ConnectionClosed,
    /// See [`Error::Connection`].
    Connection,
    /// See [`Error::Decode`].
    Decode,
}

impl Error {
    /// Returns the kind discriminant for allowlist checks.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(_) => ErrorKind::Transport,
            Error::Tls(_) => ErrorKind::Tls,
            Error::Certificate(_) => ErrorKind::Certificate,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::DuplicateRequest => ErrorKind::DuplicateRequest,
            Error::WaitTimeout => ErrorKind::WaitTimeout,
            Error::ConnectionClosed(_) => ErrorKind::ConnectionClosed,
            Error::Connection(_) => ErrorKind::Connection,
            Error::Decode(_) => ErrorKind::Decode,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Decode(e.to_string())
    }
}
