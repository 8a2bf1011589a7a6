//! File-drop requests and answers waiting for a session to pick them up.
//!
//! The host (UI or API caller) never talks to a session directly: it drops
//! outbound requests and accept/reject answers here, and each session's
//! file-drop watcher polls for the ones addressed to its peer.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::file::FileDropData;

/// Something the file-drop watcher of a session has to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropEvent {
    /// A new outbound request, already queued as source
    Outbound(FileDropData),
    /// The local user answered an inbound request
    Response {
        /// Transfer identity
        timestamp: u64,
        /// Whether the files are wanted
        accepted: bool,
    },
}

#[derive(Debug, Default)]
struct PeerDrops {
    events: VecDeque<DropEvent>,
    pending: HashMap<u64, FileDropData>,
    accepted: HashMap<u64, FileDropData>,
}

impl PeerDrops {
    fn is_empty(&self) -> bool {
        self.events.is_empty() && self.pending.is_empty() && self.accepted.is_empty()
    }
}

/// File-drop requests of all peers.
#[derive(Debug, Clone, Default)]
pub struct FileDropCenter {
    peers: Arc<RwLock<HashMap<String, PeerDrops>>>,
}

impl FileDropCenter {
    /// Create an empty center.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand an outbound request to the peer's session.
    pub async fn submit(&self, peer: &str, descriptor: FileDropData) {
        self.peers
            .write()
            .await
            .entry(peer.to_string())
            .or_default()
            .events
            .push_back(DropEvent::Outbound(descriptor));
    }

    /// Remember an inbound request until the user answers it.
    pub async fn add_pending(&self, peer: &str, descriptor: FileDropData) {
        self.peers
            .write()
            .await
            .entry(peer.to_string())
            .or_default()
            .pending
            .insert(descriptor.timestamp, descriptor);
    }

    /// Answer an inbound request.
    ///
    /// # Errors
    ///
    /// Returns `TransferNotFound` if no such request is pending.
    pub async fn respond(&self, peer: &str, timestamp: u64, accepted: bool) -> Result<()> {
        let mut peers = self.peers.write().await;
        let drops = peers
            .get_mut(peer)
            .ok_or(Error::TransferNotFound(timestamp))?;
        let descriptor = drops
            .pending
            .remove(&timestamp)
            .ok_or(Error::TransferNotFound(timestamp))?;

        if accepted {
            drops.accepted.insert(timestamp, descriptor);
        }
        drops.events.push_back(DropEvent::Response {
            timestamp,
            accepted,
        });
        Ok(())
    }

    /// Mark a transfer as accepted without a prompt, as a resumed one is.
    pub async fn accept(&self, peer: &str, descriptor: FileDropData) {
        self.peers
            .write()
            .await
            .entry(peer.to_string())
            .or_default()
            .accepted
            .insert(descriptor.timestamp, descriptor);
    }

    /// Take every event queued for a peer.
    pub async fn take_events(&self, peer: &str) -> Vec<DropEvent> {
        let mut peers = self.peers.write().await;
        let Some(drops) = peers.get_mut(peer) else {
            return Vec::new();
        };
        let events = drops.events.drain(..).collect();
        if drops.is_empty() {
            peers.remove(peer);
        }
        events
    }

    /// Take the descriptor of an accepted transfer.
    pub async fn take_accepted(&self, peer: &str, timestamp: u64) -> Option<FileDropData> {
        let mut peers = self.peers.write().await;
        let drops = peers.get_mut(peer)?;
        let descriptor = drops.accepted.remove(&timestamp);
        if drops.is_empty() {
            peers.remove(peer);
        }
        descriptor
    }

    /// Forget a request that has not reached I/O. Returns whether one existed.
    pub async fn withdraw(&self, peer: &str, timestamp: u64) -> bool {
        let mut peers = self.peers.write().await;
        let Some(drops) = peers.get_mut(peer) else {
            return false;
        };
        let removed = drops.pending.remove(&timestamp).is_some()
            | drops.accepted.remove(&timestamp).is_some();
        if drops.is_empty() {
            peers.remove(peer);
        }
        removed
    }

    /// Whether an inbound request waits for an answer.
    pub async fn is_pending(&self, peer: &str, timestamp: u64) -> bool {
        self.peers
            .read()
            .await
            .get(peer)
            .is_some_and(|d| d.pending.contains_key(&timestamp))
    }

    /// Whether an inbound request with this timestamp is pending or accepted.
    pub async fn holds(&self, peer: &str, timestamp: u64) -> bool {
        self.peers.read().await.get(peer).is_some_and(|d| {
            d.pending.contains_key(&timestamp) || d.accepted.contains_key(&timestamp)
        })
    }

    /// Inbound requests waiting for an answer, oldest first.
    pub async fn pending(&self, peer: &str) -> Vec<FileDropData> {
        let mut pending: Vec<_> = self
            .peers
            .read()
            .await
            .get(peer)
            .map(|d| d.pending.values().cloned().collect())
            .unwrap_or_default();
        pending.sort_by_key(|d| d.timestamp);
        pending
    }

    /// Drop everything held for a peer.
    pub async fn clear_peer(&self, peer: &str) {
        self.peers.write().await.remove(peer);
    }
}
