//! Error types for PeerSync.
//!
//! This module provides a unified error type for all engine operations.
//! Low-level I/O failures are translated into one of the variants below at the
//! first boundary they cross, so the session layer never sees raw transport
//! errors. Every variant belongs to one [`ErrorKind`].

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::InterruptCode;

/// A specialized `Result` type for PeerSync operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad failure class of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeout, reset, EOF or other network failure. Retryable.
    Transport,
    /// Invalid transition, unknown message shape or decode failure.
    /// The offending message is dropped and the session continues.
    Protocol,
    /// The current transfer failed. Reported locally and to the peer.
    Transfer,
    /// A stream, queue slot or peer was not available. Nothing was created.
    Resource,
    /// Bad configuration.
    Config,
}

/// The main error type for PeerSync.
#[derive(Error, Debug)]
pub enum Error {
    /// Operation timeout (E101)
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Stream was reset by the peer (E102)
    #[error("stream reset by peer")]
    StreamReset,

    /// Stream ended before the expected data arrived (E103)
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// The peer session ended while the operation was in flight (E104)
    #[error("session with peer '{0}' closed")]
    SessionClosed(String),

    /// I/O error (E105)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// State transition rejected by the transition table (E201)
    #[error("invalid transition for {exchange}: {from} -> {to}")]
    InvalidTransition {
        /// Exchange the transition was requested for
        exchange: String,
        /// Current state and role
        from: String,
        /// Requested state and role
        to: String,
    },

    /// No extension payload shape exists for this format and command (E202)
    #[error("unknown message shape: {format} with command {command}")]
    UnknownMessageShape {
        /// Payload format tag
        format: String,
        /// Role or control command
        command: String,
    },

    /// Invalid protocol message (E203)
    #[error("invalid protocol message: {0}")]
    Protocol(String),

    /// Serialization error (E204)
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Source or destination file could not be opened (E301)
    #[error("cannot open file '{path}': {reason}")]
    FileOpenFailed {
        /// File path
        path: String,
        /// Reason for failure
        reason: String,
    },

    /// Fewer bytes were copied than declared (E302)
    #[error("incomplete copy of '{file}': wrote {written} of {expected} bytes")]
    CopyIncomplete {
        /// File name as declared by the sender
        file: String,
        /// Declared size
        expected: u64,
        /// Bytes actually written
        written: u64,
    },

    /// Transfer cancelled from the local UI (E303)
    #[error("transfer cancelled locally")]
    CancelledLocal,

    /// Transfer cancelled by the peer (E304)
    #[error("transfer cancelled by peer")]
    CancelledRemote,

    /// Clipboard payload could not be sent (E305)
    #[error("clipboard send failed: {0}")]
    ClipboardSendFailed(String),

    /// Clipboard payload did not arrive in time (E306)
    #[error("clipboard receive timed out after {0:?}")]
    ClipboardReceiveTimeout(Duration),

    /// Clipboard stream closed before the declared length arrived (E307)
    #[error("incomplete clipboard payload: received {received} of {expected} bytes")]
    ClipboardReceiveIncomplete {
        /// Declared total length
        expected: u64,
        /// Bytes received
        received: u64,
    },

    /// A received path is absolute or escapes the destination directory (E308)
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Transfer rejected by receiver (E309)
    #[error("transfer rejected by receiver")]
    TransferRejected,

    /// No stream for this channel could be obtained (E401)
    #[error("no {channel} stream available for peer '{peer}'")]
    StreamUnavailable {
        /// Peer identity
        peer: String,
        /// Channel name
        channel: String,
    },

    /// Transport failed to open a stream (E402)
    #[error("failed to open {channel} stream to peer '{peer}': {reason}")]
    StreamOpenFailed {
        /// Peer identity
        peer: String,
        /// Channel name
        channel: String,
        /// Transport error
        reason: String,
    },

    /// Too many transfers queued for a peer (E403)
    #[error("transfer queue for peer '{peer}' is full ({limit} entries)")]
    QueueFull {
        /// Peer identity
        peer: String,
        /// Configured limit
        limit: usize,
    },

    /// A transfer with this timestamp is already queued (E404)
    #[error("transfer {0} is already queued")]
    DuplicateTransfer(u64),

    /// Peer is not in the roster (E405)
    #[error("peer '{0}' not found")]
    PeerNotFound(String),

    /// A session for this peer is already running (E406)
    #[error("a session for peer '{0}' is already running")]
    SessionExists(String),

    /// No transfer with this timestamp is known (E407)
    #[error("transfer {0} not found")]
    TransferNotFound(u64),

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidConfig {
        /// Configuration key
        key: String,
        /// Reason for invalidity
        reason: String,
    },

    /// Platform clipboard access failed
    #[error("clipboard error: {0}")]
    ClipboardError(String),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Translate an I/O error raised by a peer stream.
    ///
    /// Resets, EOF and timeouts get their own variants so they are never
    /// conflated with other I/O failures.
    #[must_use]
    pub fn from_stream(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Self::StreamReset,
            io::ErrorKind::UnexpectedEof => Self::UnexpectedEof,
            io::ErrorKind::TimedOut => Self::Timeout(Duration::ZERO),
            _ => Self::Io(err),
        }
    }

    /// Returns the failure class of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_)
            | Self::StreamReset
            | Self::UnexpectedEof
            | Self::SessionClosed(_)
            | Self::Io(_) => ErrorKind::Transport,
            Self::InvalidTransition { .. }
            | Self::UnknownMessageShape { .. }
            | Self::Protocol(_)
            | Self::Serialization(_) => ErrorKind::Protocol,
            Self::FileOpenFailed { .. }
            | Self::CopyIncomplete { .. }
            | Self::CancelledLocal
            | Self::CancelledRemote
            | Self::ClipboardSendFailed(_)
            | Self::ClipboardReceiveTimeout(_)
            | Self::ClipboardReceiveIncomplete { .. }
            | Self::InvalidPath(_)
            | Self::TransferRejected
            | Self::ClipboardError(_) => ErrorKind::Transfer,
            Self::StreamUnavailable { .. }
            | Self::StreamOpenFailed { .. }
            | Self::QueueFull { .. }
            | Self::DuplicateTransfer(_)
            | Self::PeerNotFound(_)
            | Self::SessionExists(_)
            | Self::TransferNotFound(_)
            | Self::Internal(_) => ErrorKind::Resource,
            Self::ConfigError(_) | Self::InvalidConfig { .. } => ErrorKind::Config,
        }
    }

    /// Returns the error code associated with this error, if any.
    ///
    /// Error codes follow the pattern EXXX: E1xx transport, E2xx protocol,
    /// E3xx transfer, E4xx resource.
    #[must_use]
    pub const fn code(&self) -> Option<&'static str> {
        match self {
            Self::Timeout(_) => Some("E101"),
            Self::StreamReset => Some("E102"),
            Self::UnexpectedEof => Some("E103"),
            Self::SessionClosed(_) => Some("E104"),
            Self::Io(_) => Some("E105"),
            Self::InvalidTransition { .. } => Some("E201"),
            Self::UnknownMessageShape { .. } => Some("E202"),
            Self::Protocol(_) => Some("E203"),
            Self::Serialization(_) => Some("E204"),
            Self::FileOpenFailed { .. } => Some("E301"),
            Self::CopyIncomplete { .. } => Some("E302"),
            Self::CancelledLocal => Some("E303"),
            Self::CancelledRemote => Some("E304"),
            Self::ClipboardSendFailed(_) => Some("E305"),
            Self::ClipboardReceiveTimeout(_) => Some("E306"),
            Self::ClipboardReceiveIncomplete { .. } => Some("E307"),
            Self::InvalidPath(_) => Some("E308"),
            Self::TransferRejected => Some("E309"),
            Self::StreamUnavailable { .. } => Some("E401"),
            Self::StreamOpenFailed { .. } => Some("E402"),
            Self::QueueFull { .. } => Some("E403"),
            Self::DuplicateTransfer(_) => Some("E404"),
            Self::PeerNotFound(_) => Some("E405"),
            Self::SessionExists(_) => Some("E406"),
            Self::TransferNotFound(_) => Some("E407"),
            _ => None,
        }
    }

    /// Returns whether this error is recoverable (can be retried).
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport)
    }

    /// Returns whether this error is a cancellation, local or remote.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::CancelledLocal | Self::CancelledRemote)
    }

    /// The interrupt code reported to the peer when this error ends a transfer.
    #[must_use]
    pub const fn interrupt_code(&self) -> InterruptCode {
        match self {
            Self::CancelledLocal | Self::CancelledRemote => InterruptCode::Cancelled,
            Self::FileOpenFailed { .. } => InterruptCode::FileNotFound,
            Self::CopyIncomplete { .. }
            | Self::ClipboardReceiveIncomplete { .. }
            | Self::UnexpectedEof => InterruptCode::CopyIncomplete,
            Self::Timeout(_) | Self::ClipboardReceiveTimeout(_) => InterruptCode::Timeout,
            Self::StreamUnavailable { .. }
            | Self::StreamOpenFailed { .. }
            | Self::StreamReset
            | Self::SessionClosed(_) => InterruptCode::StreamFailed,
            Self::InvalidPath(_) => InterruptCode::InvalidPath,
            Self::QueueFull { .. } | Self::DuplicateTransfer(_) => InterruptCode::QueueFull,
            _ => InterruptCode::Io,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_errors_are_translated() {
        let reset = Error::from_stream(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(matches!(reset, Error::StreamReset));

        let eof = Error::from_stream(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(matches!(eof, Error::UnexpectedEof));

        let other = Error::from_stream(io::Error::other("disk on fire"));
        assert!(matches!(other, Error::Io(_)));
    }

    #[test]
    fn test_transport_errors_are_recoverable() {
        assert!(Error::Timeout(Duration::from_secs(5)).is_recoverable());
        assert_eq!(
            Error::Timeout(Duration::from_millis(250)).to_string(),
            "operation timed out after 250ms"
        );
        assert!(Error::StreamReset.is_recoverable());
        assert!(!Error::CancelledLocal.is_recoverable());
        assert!(!Error::TransferRejected.is_recoverable());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::Protocol("x".into()).kind(), ErrorKind::Protocol);
        assert_eq!(
            Error::QueueFull {
                peer: "p".into(),
                limit: 1
            }
            .kind(),
            ErrorKind::Resource
        );
        assert_eq!(Error::CancelledRemote.kind(), ErrorKind::Transfer);
    }

    #[test]
    fn test_codes_are_distinct_for_cancellation_origins() {
        assert_eq!(Error::CancelledLocal.code(), Some("E303"));
        assert_eq!(Error::CancelledRemote.code(), Some("E304"));
        assert_eq!(Error::Internal("x".into()).code(), None);
    }

    #[test]
    fn test_interrupt_codes() {
        let incomplete = Error::CopyIncomplete {
            file: "x.bin".into(),
            expected: 1000,
            written: 600,
        };
        assert_eq!(incomplete.interrupt_code(), InterruptCode::CopyIncomplete);
        assert_eq!(
            Error::CancelledLocal.interrupt_code(),
            InterruptCode::Cancelled
        );
        assert_eq!(
            Error::FileOpenFailed {
                path: "a".into(),
                reason: "gone".into()
            }
            .interrupt_code(),
            InterruptCode::FileNotFound
        );
    }
}
