//! Clipboard snapshots and the process-wide clipboard hub.
//!
//! The hub holds the most recent [`ClipboardSnapshot`] in a `watch` channel:
//! readers always see a complete snapshot, and every session subscribes to
//! it to learn about local clipboard changes.
//!
//! ## Sources of snapshots
//!
//! - Local changes, published by [`ClipboardPoller`] or directly by the host
//!   through [`ClipboardHub::publish_local`]
//! - Content received from a peer, applied with [`ClipboardHub::apply_remote`]
//!
//! A snapshot is "new" if its `(hash, timestamp)` pair has not been seen.
//! Content whose hash equals the current snapshot is not republished, which
//! keeps a just-applied remote paste from echoing back.

pub mod access;
pub mod transport;

pub use access::{ClipboardAccess, ClipboardPoller, MemoryClipboard};
pub use transport::{build_payload, receive_clipboard, send_clipboard, split_payload};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use xxhash_rust::xxh64::{xxh64, Xxh64};

use crate::error::Result;
use crate::protocol::FmtType;

/// A rich clipboard bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClipBundle {
    /// UTF-8 text
    pub text: Vec<u8>,
    /// Encoded image
    pub image: Vec<u8>,
    /// HTML fragment
    pub html: Vec<u8>,
    /// RTF document (kept locally, not replicated)
    pub rtf: Vec<u8>,
    /// Image width in pixels
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
}

/// Clipboard content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClipPayload {
    /// Plain text
    Text(String),
    /// Text, image and markup together
    Bundle(ClipBundle),
}

impl ClipPayload {
    /// Content hash (0 is never produced for non-empty content in practice).
    #[must_use]
    pub fn hash(&self) -> u64 {
        match self {
            Self::Text(text) => xxh64(text.as_bytes(), 0),
            Self::Bundle(bundle) => {
                // Length-prefixed: ("ab", "c") and ("a", "bc") must differ.
                let mut hasher = Xxh64::new(1);
                for segment in [&bundle.text, &bundle.image, &bundle.html] {
                    hasher.update(&(segment.len() as u64).to_le_bytes());
                    hasher.update(segment);
                }
                hasher.digest()
            }
        }
    }

    /// Format tag of the content.
    #[must_use]
    pub const fn format(&self) -> FmtType {
        match self {
            Self::Text(_) => FmtType::TextCb,
            Self::Bundle(_) => FmtType::XclipCb,
        }
    }

    /// Size of the replicated part in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        match self {
            Self::Text(text) => text.len() as u64,
            Self::Bundle(b) => (b.text.len() + b.image.len() + b.html.len()) as u64,
        }
    }
}

/// The latest clipboard content known to this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipboardSnapshot {
    /// Device the content came from
    pub source_id: String,
    /// Content hash
    pub hash: u64,
    /// Capture time in milliseconds
    pub timestamp: u64,
    /// Content
    pub payload: ClipPayload,
}

impl ClipboardSnapshot {
    /// Format tag of the snapshot.
    #[must_use]
    pub const fn format(&self) -> FmtType {
        self.payload.format()
    }
}

/// Process-wide clipboard state.
#[derive(Clone)]
pub struct ClipboardHub {
    local_id: String,
    tx: Arc<watch::Sender<Option<Arc<ClipboardSnapshot>>>>,
    sink: Arc<dyn ClipboardAccess>,
    last_timestamp: Arc<AtomicU64>,
}

impl std::fmt::Debug for ClipboardHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClipboardHub")
            .field("local_id", &self.local_id)
            .finish_non_exhaustive()
    }
}

impl ClipboardHub {
    /// Create a hub that writes remote content to `sink`.
    #[must_use]
    pub fn new(local_id: impl Into<String>, sink: Arc<dyn ClipboardAccess>) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            local_id: local_id.into(),
            tx: Arc::new(tx),
            sink,
            last_timestamp: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Identity of this device.
    #[must_use]
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    fn next_timestamp(&self) -> u64 {
        let now = crate::now_millis();
        let prev = self
            .last_timestamp
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(prev + 1)
    }

    fn is_current(&self, hash: u64) -> bool {
        self.tx
            .borrow()
            .as_ref()
            .is_some_and(|snapshot| snapshot.hash == hash)
    }

    /// Publish locally captured content.
    ///
    /// Returns `None` if the content equals the current snapshot.
    pub fn publish_local(&self, payload: ClipPayload) -> Option<Arc<ClipboardSnapshot>> {
        let hash = payload.hash();
        if self.is_current(hash) {
            return None;
        }

        let snapshot = Arc::new(ClipboardSnapshot {
            source_id: self.local_id.clone(),
            hash,
            timestamp: self.next_timestamp(),
            payload,
        });
        tracing::debug!(
            "Local clipboard changed ({}, {} bytes)",
            snapshot.format(),
            snapshot.payload.len()
        );
        self.tx.send_replace(Some(Arc::clone(&snapshot)));
        Some(snapshot)
    }

    /// Apply content received from `peer`: write it to the platform clipboard
    /// and make it the current snapshot.
    ///
    /// # Errors
    ///
    /// Returns `ClipboardError` if the platform clipboard rejects the write.
    pub fn apply_remote(&self, peer: &str, payload: ClipPayload) -> Result<Arc<ClipboardSnapshot>> {
        self.sink.write(&payload)?;

        let snapshot = Arc::new(ClipboardSnapshot {
            source_id: peer.to_string(),
            hash: payload.hash(),
            timestamp: self.next_timestamp(),
            payload,
        });
        self.tx.send_replace(Some(Arc::clone(&snapshot)));
        Ok(snapshot)
    }

    /// The current snapshot.
    #[must_use]
    pub fn current(&self) -> Option<Arc<ClipboardSnapshot>> {
        self.tx.borrow().clone()
    }

    /// Observe snapshot changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<ClipboardSnapshot>>> {
        self.tx.subscribe()
    }
}
