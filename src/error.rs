//! Error types for the relay.
//!
//! Handshake-phase errors are local to the rejected connection. Session
//! errors end their own session only. Nothing here is fatal to the process
//! except a listener bind failure, which surfaces as [`Error::Io`] from
//! [`ConnectionManager::bind`](crate::server::ConnectionManager::bind).

use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while negotiating or relaying a connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// No complete upgrade request arrived within the handshake timeout.
    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// The upgrade request could not be parsed.
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// The request is HTTP but not a WebSocket upgrade.
    #[error("Not a WebSocket upgrade request")]
    NotWebSocket,

    /// A handshake key contained no space characters.
    #[error("Key division error: {0} has no spaces")]
    KeyDivision(&'static str),

    /// The upgrade request exceeded the configured size limit.
    #[error("Handshake too large: {size} bytes (max: {max})")]
    HandshakeTooLarge {
        /// Bytes received so far.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// The client did not offer the `base64` sub-protocol and the policy requires it.
    #[error("Client did not offer the base64 sub-protocol")]
    Base64NotOffered,

    /// The authentication gate rejected the connection.
    #[error("Authentication denied")]
    AuthDenied,

    /// A target address could not be parsed.
    #[error("Invalid target address: {0}")]
    InvalidTarget(String),

    /// A per-request target override was rejected by the port whitelist.
    #[error("Target not allowed: {0}")]
    TargetNotAllowed(String),

    /// Token-based target selection found no usable token.
    #[error("Unknown token: {0}")]
    UnknownToken(String),

    /// The target could not be connected.
    #[error("Target {target} unreachable: {reason}")]
    TargetUnreachable {
        /// The `host:port` that was dialled.
        target: String,
        /// Why the connect failed.
        reason: String,
    },

    /// The target closed its side of the connection.
    #[error("Target closed")]
    TargetClosed,

    /// The client sent a close frame or closed its socket.
    #[error("Client closed")]
    ClientClosed,

    /// Readiness or transfer failure on either socket.
    #[error("Socket exception: {0}")]
    SocketException(String),

    /// The TLS handshake failed or a plain connection was refused.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Client frame data could not be decoded.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// I/O error outside the relay loop.
    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Whether this error was raised before a session existed.
    ///
    /// A [`Error::KeyDivision`] counts as a malformed request.
    #[must_use]
    pub const fn is_handshake_failure(&self) -> bool {
        matches!(
            self,
            Error::HandshakeTimeout
                | Error::MalformedRequest(_)
                | Error::NotWebSocket
                | Error::KeyDivision(_)
                | Error::HandshakeTooLarge { .. }
                | Error::Base64NotOffered
                | Error::Tls(_)
        )
    }

    /// Whether this is a normal end of a session rather than a failure.
    #[must_use]
    pub const fn is_orderly(&self) -> bool {
        matches!(self, Error::TargetClosed | Error::ClientClosed)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
