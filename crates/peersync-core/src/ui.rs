//! UI capability interface.
//!
//! The engine reports everything the user may want to see through a
//! [`UiSink`] injected at construction. Notifications are fire-and-forget:
//! a sink must not block.

use std::path::PathBuf;

use tokio::sync::mpsc;

use crate::file::{FileDropData, TransferProgress};
use crate::protocol::{FmtType, InterruptCode};
use crate::queue::Direction;

/// Which side of a transfer caused a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The sending device
    Source,
    /// The receiving device
    Destination,
}

/// A notification for the local user.
#[derive(Debug, Clone)]
pub enum UiEvent {
    /// A session with the peer is up
    PeerConnected {
        /// Peer identity
        peer: String,
    },
    /// The session with the peer ended
    PeerDisconnected {
        /// Peer identity
        peer: String,
    },
    /// Clipboard content from a peer was applied locally
    ClipboardReceived {
        /// Peer identity
        peer: String,
        /// Format of the content
        format: FmtType,
        /// Payload size in bytes
        bytes: u64,
    },
    /// A peer offers files; answer with `respond_to_file_drop`
    FileDropRequest {
        /// Peer identity
        peer: String,
        /// What is offered
        descriptor: FileDropData,
    },
    /// A folder of an incoming transfer was created
    FolderCreated {
        /// Peer identity
        peer: String,
        /// Transfer identity
        timestamp: u64,
        /// Created folder
        path: PathBuf,
    },
    /// Periodic transfer progress
    Progress(TransferProgress),
    /// A transfer finished
    TransferCompleted {
        /// Peer identity
        peer: String,
        /// Transfer identity
        timestamp: u64,
        /// Our side of the transfer
        direction: Direction,
        /// Files written (empty when sending)
        files: Vec<PathBuf>,
    },
    /// The peer declined our files
    TransferRejected {
        /// Peer identity
        peer: String,
        /// Transfer identity
        timestamp: u64,
    },
    /// A transfer failed
    TransferFailed {
        /// Peer identity
        peer: String,
        /// Transfer or clipboard snapshot identity
        timestamp: u64,
        /// Format of the exchange
        format: FmtType,
        /// Side that failed
        side: Side,
        /// Failure cause
        code: InterruptCode,
        /// The local user cancelled it
        cancelled_locally: bool,
        /// Description
        detail: String,
    },
    /// A transfer was withdrawn before any bytes moved
    TransferCancelled {
        /// Peer identity
        peer: String,
        /// Transfer identity
        timestamp: u64,
        /// The peer withdrew it
        by_peer: bool,
    },
    /// Answer to a resume request
    RecoverResult {
        /// Peer identity
        peer: String,
        /// Transfer identity
        timestamp: u64,
        /// The sender resumes the transfer
        accepted: bool,
    },
    /// Any other error worth showing
    Error {
        /// Peer identity, if the error is tied to one
        peer: Option<String>,
        /// Description
        message: String,
    },
}

/// Receives UI notifications from the engine.
pub trait UiSink: Send + Sync {
    /// Deliver one notification.
    fn notify(&self, event: UiEvent);
}

/// Discards every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullUi;

impl UiSink for NullUi {
    fn notify(&self, _event: UiEvent) {}
}

/// Forwards notifications to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelUi {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl ChannelUi {
    /// Create the sink and the receiving end.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl UiSink for ChannelUi {
    fn notify(&self, event: UiEvent) {
        let _ = self.tx.send(event);
    }
}
