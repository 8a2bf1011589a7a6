//! Per-peer transfer queue.
//!
//! Every file-drop transfer a peer takes part in is an entry in that peer's
//! FIFO queue, keyed by the transfer timestamp. Entries carry the direction
//! of the transfer and, once a transfer task runs, the handle used to cancel
//! it.
//!
//! Admission is per direction: a transfer may move bytes only while fewer
//! than `max_concurrent` entries of the same direction are queued ahead of
//! it. Anything beyond that waits in [`TransferQueue::wait_for_slot`] until a
//! dequeue frees a slot. Enqueue only fails past `max_queued` entries.
//!
//! Interrupted transfers are kept aside (in memory only) so they can be
//! resumed later.

mod cancel;

pub use cancel::{CancelHandle, CancelOrigin};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::file::FileDropData;

/// Which side of a transfer this device is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Direction {
    /// Sending
    AsSrc,
    /// Receiving
    AsDst,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AsSrc => f.write_str("send"),
            Self::AsDst => f.write_str("receive"),
        }
    }
}

/// One queued transfer.
#[derive(Debug, Clone)]
pub struct TransferQueueEntry {
    /// Transfer descriptor
    pub descriptor: FileDropData,
    /// Our side of the transfer
    pub direction: Direction,
    /// Handle that aborts the running transfer task
    pub cancel: Option<CancelHandle>,
    /// The local user asked for this transfer to be cancelled
    pub cancelled_by_local_ui: bool,
}

impl TransferQueueEntry {
    fn timestamp(&self) -> u64 {
        self.descriptor.timestamp
    }
}

/// A read-only view of a queued transfer for UI lists.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedTransfer {
    /// Transfer identity
    pub timestamp: u64,
    /// Our side of the transfer
    pub direction: Direction,
    /// Number of files
    pub files: usize,
    /// Total bytes
    pub total_size: u64,
    /// A transfer task has been started for this entry
    pub started: bool,
}

/// Result of [`TransferQueue::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// No such entry
    NotFound,
    /// The running transfer task was signalled
    Signalled,
    /// The entry exists but no transfer task is running for it yet
    NoHandle,
}

#[derive(Debug, Default)]
struct PeerQueue {
    entries: VecDeque<TransferQueueEntry>,
    interrupted: HashMap<u64, (Direction, FileDropData)>,
}

impl PeerQueue {
    fn position(&self, timestamp: u64) -> Option<usize> {
        self.entries.iter().position(|e| e.timestamp() == timestamp)
    }

    fn get_mut(&mut self, timestamp: u64) -> Option<&mut TransferQueueEntry> {
        self.entries.iter_mut().find(|e| e.timestamp() == timestamp)
    }

    fn count(&self, direction: Direction) -> usize {
        self.entries
            .iter()
            .filter(|e| e.direction == direction)
            .count()
    }
}

/// Transfer queues of all peers behind one map-wide lock.
#[derive(Debug, Clone)]
pub struct TransferQueue {
    peers: Arc<RwLock<HashMap<String, PeerQueue>>>,
    changed: Arc<Notify>,
    max_concurrent: usize,
    max_queued: usize,
}

impl TransferQueue {
    /// Create a queue with the given admission bounds.
    #[must_use]
    pub fn new(max_concurrent: usize, max_queued: usize) -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            changed: Arc::new(Notify::new()),
            max_concurrent: max_concurrent.max(1),
            max_queued,
        }
    }

    /// Append a transfer to the peer's queue.
    ///
    /// Returns the descriptor's timestamp, which identifies the entry.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateTransfer` if the timestamp is already queued and
    /// `QueueFull` if the peer already has `max_queued` entries.
    pub async fn enqueue(
        &self,
        peer: &str,
        descriptor: FileDropData,
        direction: Direction,
    ) -> Result<u64> {
        let timestamp = descriptor.timestamp;
        let mut peers = self.peers.write().await;
        let queue = peers.entry(peer.to_string()).or_default();

        if queue.position(timestamp).is_some() {
            return Err(Error::DuplicateTransfer(timestamp));
        }
        if queue.entries.len() >= self.max_queued {
            return Err(Error::QueueFull {
                peer: peer.to_string(),
                limit: self.max_queued,
            });
        }

        queue.entries.push_back(TransferQueueEntry {
            descriptor,
            direction,
            cancel: None,
            cancelled_by_local_ui: false,
        });
        tracing::debug!(
            "Queued {} transfer {} for {} (depth {})",
            direction,
            timestamp,
            peer,
            queue.entries.len()
        );
        drop(peers);

        self.changed.notify_waiters();
        Ok(timestamp)
    }

    /// Remove a transfer. Returns whether it was queued.
    pub async fn dequeue(&self, peer: &str, timestamp: u64) -> bool {
        let removed = {
            let mut peers = self.peers.write().await;
            let Some(queue) = peers.get_mut(peer) else {
                return false;
            };
            let removed = queue
                .position(timestamp)
                .and_then(|idx| queue.entries.remove(idx))
                .is_some();
            if queue.entries.is_empty() && queue.interrupted.is_empty() {
                peers.remove(peer);
            }
            removed
        };

        if removed {
            tracing::debug!("Dequeued transfer {} for {}", timestamp, peer);
            self.changed.notify_waiters();
        }
        removed
    }

    /// Total queued transfers for a peer.
    pub async fn depth(&self, peer: &str) -> usize {
        self.peers
            .read()
            .await
            .get(peer)
            .map_or(0, |q| q.entries.len())
    }

    /// Queued outbound transfers for a peer.
    pub async fn send_depth(&self, peer: &str) -> usize {
        self.direction_depth(peer, Direction::AsSrc).await
    }

    /// Queued inbound transfers for a peer.
    pub async fn recv_depth(&self, peer: &str) -> usize {
        self.direction_depth(peer, Direction::AsDst).await
    }

    async fn direction_depth(&self, peer: &str, direction: Direction) -> usize {
        self.peers
            .read()
            .await
            .get(peer)
            .map_or(0, |q| q.count(direction))
    }

    /// Register how to abort the running task of a transfer.
    ///
    /// Returns false if the transfer is not queued. If the local user already
    /// cancelled the entry, the handle is cancelled straight away.
    pub async fn set_cancel_handle(&self, peer: &str, timestamp: u64, handle: CancelHandle) -> bool {
        let mut peers = self.peers.write().await;
        let Some(entry) = peers.get_mut(peer).and_then(|q| q.get_mut(timestamp)) else {
            return false;
        };
        if entry.cancelled_by_local_ui {
            handle.cancel(CancelOrigin::LocalUi);
        }
        entry.cancel = Some(handle);
        true
    }

    /// Cancel a transfer.
    ///
    /// Records whether the local UI asked for it, and signals the running
    /// transfer task if there is one.
    pub async fn cancel(&self, peer: &str, timestamp: u64, origin: CancelOrigin) -> CancelOutcome {
        let mut peers = self.peers.write().await;
        let Some(entry) = peers.get_mut(peer).and_then(|q| q.get_mut(timestamp)) else {
            return CancelOutcome::NotFound;
        };

        if origin == CancelOrigin::LocalUi {
            entry.cancelled_by_local_ui = true;
        }
        match &entry.cancel {
            Some(handle) => {
                handle.cancel(origin);
                CancelOutcome::Signalled
            }
            None => CancelOutcome::NoHandle,
        }
    }

    /// Whether the local UI cancelled this transfer.
    pub async fn cancelled_by_local_ui(&self, peer: &str, timestamp: u64) -> bool {
        self.peers
            .read()
            .await
            .get(peer)
            .and_then(|q| q.entries.iter().find(|e| e.timestamp() == timestamp))
            .is_some_and(|e| e.cancelled_by_local_ui)
    }

    /// The descriptor of a queued transfer.
    pub async fn descriptor(&self, peer: &str, timestamp: u64) -> Option<FileDropData> {
        self.entry(peer, timestamp).await.map(|e| e.descriptor)
    }

    /// A copy of a queued entry.
    pub async fn entry(&self, peer: &str, timestamp: u64) -> Option<TransferQueueEntry> {
        self.peers
            .read()
            .await
            .get(peer)
            .and_then(|q| q.entries.iter().find(|e| e.timestamp() == timestamp))
            .cloned()
    }

    /// Whether a transfer is queued.
    pub async fn contains(&self, peer: &str, timestamp: u64) -> bool {
        self.entry(peer, timestamp).await.is_some()
    }

    /// Wait until the transfer may start moving bytes.
    ///
    /// # Errors
    ///
    /// Returns `TransferNotFound` if the entry leaves the queue while waiting
    /// and `SessionClosed` if `cancel` fires.
    pub async fn wait_for_slot(
        &self,
        peer: &str,
        timestamp: u64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut deferred = false;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let peers = self.peers.read().await;
                let Some((queue, idx)) = peers
                    .get(peer)
                    .and_then(|q| q.position(timestamp).map(|idx| (q, idx)))
                else {
                    return Err(Error::TransferNotFound(timestamp));
                };

                let direction = queue.entries[idx].direction;
                let ahead = queue
                    .entries
                    .iter()
                    .take(idx)
                    .filter(|e| e.direction == direction)
                    .count();
                if ahead < self.max_concurrent {
                    return Ok(());
                }
                if !deferred {
                    tracing::debug!(
                        "Transfer {} for {} deferred behind {} {} transfer(s)",
                        timestamp,
                        peer,
                        ahead,
                        direction
                    );
                    deferred = true;
                }
            }

            tokio::select! {
                () = &mut notified => {}
                () = cancel.cancelled() => return Err(Error::SessionClosed(peer.to_string())),
            }
        }
    }

    /// Snapshot of a peer's queue in FIFO order.
    pub async fn snapshot(&self, peer: &str) -> Vec<QueuedTransfer> {
        self.peers.read().await.get(peer).map_or_else(Vec::new, |q| {
            q.entries
                .iter()
                .map(|e| QueuedTransfer {
                    timestamp: e.timestamp(),
                    direction: e.direction,
                    files: e.descriptor.files.len(),
                    total_size: e.descriptor.total_size,
                    started: e.cancel.is_some(),
                })
                .collect()
        })
    }

    /// Drop every queued entry of a peer. Interrupted records are kept.
    ///
    /// Returns the cancel handles of entries that had a running task.
    pub async fn clear_peer(&self, peer: &str) -> Vec<CancelHandle> {
        let handles = {
            let mut peers = self.peers.write().await;
            let Some(queue) = peers.get_mut(peer) else {
                return Vec::new();
            };
            let handles = queue
                .entries
                .drain(..)
                .filter_map(|e| e.cancel)
                .collect::<Vec<_>>();
            if queue.interrupted.is_empty() {
                peers.remove(peer);
            }
            handles
        };
        self.changed.notify_waiters();
        handles
    }

    /// Keep an interrupted transfer aside so it can be resumed.
    pub async fn record_interrupted(
        &self,
        peer: &str,
        direction: Direction,
        descriptor: FileDropData,
    ) {
        tracing::debug!(
            "Recorded interrupted {} transfer {} for {}",
            direction,
            descriptor.timestamp,
            peer
        );
        self.peers
            .write()
            .await
            .entry(peer.to_string())
            .or_default()
            .interrupted
            .insert(descriptor.timestamp, (direction, descriptor));
    }

    /// Remove and return an interrupted record.
    pub async fn take_interrupted(
        &self,
        peer: &str,
        timestamp: u64,
    ) -> Option<(Direction, FileDropData)> {
        self.peers
            .write()
            .await
            .get_mut(peer)
            .and_then(|q| q.interrupted.remove(&timestamp))
    }

    /// Interrupted transfers of a peer, oldest first.
    pub async fn interrupted(&self, peer: &str) -> Vec<(Direction, FileDropData)> {
        let mut records: Vec<_> = self
            .peers
            .read()
            .await
            .get(peer)
            .map(|q| q.interrupted.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by_key(|(_, d)| d.timestamp);
        records
    }
}
