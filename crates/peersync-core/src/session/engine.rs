//! The service API exposed to host shells.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::drops::FileDropCenter;
use super::peer::{PeerSession, SessionEvent};
use super::state::Exchange;
use crate::clipboard::{ClipPayload, ClipboardAccess, ClipboardHub, ClipboardSnapshot};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::file::FileDropData;
use crate::protocol::{CancelPayload, Command, ExtData, FmtType, Message, State};
use crate::queue::{CancelOrigin, CancelOutcome, Direction, QueuedTransfer, TransferQueue};
use crate::registry::{Channel, FormatStream, StreamRegistry};
use crate::roster::{should_dial, Roster};
use crate::transport::{StreamHandler, StreamTransport};
use crate::ui::{UiEvent, UiSink};

/// Delay between attempts to open the control stream.
const DIAL_RETRY: Duration = Duration::from_millis(200);

/// Who this device is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    /// Stable peer identity
    pub id: String,
    /// Platform tag sent in every envelope
    pub platform: String,
    /// Display name
    pub device_name: String,
}

impl LocalIdentity {
    /// Identity `id` with platform and name taken from the configuration.
    #[must_use]
    pub fn from_config(id: impl Into<String>, config: &Config) -> Self {
        Self {
            id: id.into(),
            platform: config.general.platform.clone(),
            device_name: config.general.device_name.clone(),
        }
    }
}

pub(super) struct SessionHandle {
    pub(super) id: u64,
    pub(super) cancel: CancellationToken,
    pub(super) outbox: mpsc::Sender<Message>,
    pub(super) events: mpsc::Sender<SessionEvent>,
    pub(super) task: JoinHandle<()>,
}

/// State shared by the engine and every session task.
pub(super) struct Shared {
    pub(super) identity: LocalIdentity,
    pub(super) config: Config,
    pub(super) registry: StreamRegistry,
    pub(super) queue: TransferQueue,
    pub(super) clipboard: ClipboardHub,
    pub(super) roster: Roster,
    pub(super) drops: FileDropCenter,
    pub(super) ui: Arc<dyn UiSink>,
    pub(super) sessions: RwLock<HashMap<String, SessionHandle>>,
    root: CancellationToken,
    next_session: AtomicU64,
    last_timestamp: AtomicU64,
}

impl Shared {
    /// An envelope from this device.
    pub(super) fn message(
        &self,
        fmt: FmtType,
        state: State,
        command: Command,
        timestamp: u64,
        ext: ExtData,
    ) -> Message {
        Message {
            source_id: self.identity.id.clone(),
            source_platform: self.identity.platform.clone(),
            fmt,
            state,
            command,
            timestamp,
            ext,
        }
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

    /// Remove a session from the map if it is still the one with `id`.
    pub(super) async fn detach_session(&self, peer: &str, id: u64) {
        let mut sessions = self.sessions.write().await;
        if sessions.get(peer).is_some_and(|s| s.id == id) {
            sessions.remove(peer);
        }
    }
}

/// Peer synchronization engine.
///
/// Cheap to clone; all clones drive the same sessions.
#[derive(Clone)]
pub struct SyncEngine {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("identity", &self.shared.identity)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Create an engine.
    ///
    /// `transport` opens streams to peers; inbound streams must be routed to
    /// [`stream_handler`](Self::stream_handler). Remote clipboard content is
    /// written to `clipboard`, and everything user-facing goes to `ui`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the configuration does not validate.
    pub fn new(
        identity: LocalIdentity,
        config: Config,
        transport: Arc<dyn StreamTransport>,
        roster: Roster,
        clipboard: Arc<dyn ClipboardAccess>,
        ui: Arc<dyn UiSink>,
    ) -> Result<Self> {
        config.validate()?;

        let registry = StreamRegistry::new(transport, config.session.connect_timeout);
        let queue = TransferQueue::new(
            config.transfer.max_concurrent_transfers,
            config.transfer.max_queued_transfers,
        );
        let clipboard = ClipboardHub::new(identity.id.clone(), clipboard);

        Ok(Self {
            shared: Arc::new(Shared {
                identity,
                config,
                registry,
                queue,
                clipboard,
                roster,
                drops: FileDropCenter::new(),
                ui,
                sessions: RwLock::new(HashMap::new()),
                root: CancellationToken::new(),
                next_session: AtomicU64::new(1),
                last_timestamp: AtomicU64::new(0),
            }),
        })
    }

    /// This device's identity.
    pub fn identity(&self) -> &LocalIdentity {
        &self.shared.identity
    }

    /// Engine configuration.
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// The stream registry.
    pub fn registry(&self) -> &StreamRegistry {
        &self.shared.registry
    }

    /// The handler a transport hands inbound streams to.
    pub fn stream_handler(&self) -> Arc<dyn StreamHandler> {
        Arc::new(self.shared.registry.clone())
    }

    /// The transfer queue.
    pub fn queue(&self) -> &TransferQueue {
        &self.shared.queue
    }

    /// The clipboard hub.
    pub fn clipboard(&self) -> &ClipboardHub {
        &self.shared.clipboard
    }

    /// Known peers.
    pub fn roster(&self) -> &Roster {
        &self.shared.roster
    }

    /// Connect to a peer and start its session.
    ///
    /// The side with the greater identity opens the control stream; the
    /// other side waits for it.
    ///
    /// # Errors
    ///
    /// Returns `SessionExists` if the peer already has a session, and the
    /// stream error if the control stream cannot be established within the
    /// stream-ready timeout.
    pub async fn start_process_for_peer(&self, peer: &str) -> Result<()> {
        if self.shared.sessions.read().await.contains_key(peer) {
            return Err(Error::SessionExists(peer.to_string()));
        }

        let registry = &self.shared.registry;
        registry.add_peer(peer).await;

        let control = if should_dial(&self.shared.identity.id, peer) {
            tracing::debug!("Dialling {}", peer);
            self.dial(peer).await
        } else {
            tracing::debug!("Waiting for {} to dial", peer);
            registry
                .ensure_ready(
                    peer,
                    Channel::Control,
                    self.shared.config.session.stream_ready_timeout,
                    &self.shared.root,
                )
                .await
        };
        let control = match control {
            Ok(stream) => stream,
            Err(e) => {
                registry.remove_peer(peer).await;
                return Err(e);
            }
        };

        let mut sessions = self.shared.sessions.write().await;
        if sessions.contains_key(peer) {
            return Err(Error::SessionExists(peer.to_string()));
        }
        let id = self.shared.next_session.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shared.root.child_token();
        let handle = PeerSession::spawn(Arc::clone(&self.shared), peer, id, control, cancel);
        sessions.insert(peer.to_string(), handle);
        Ok(())
    }

    async fn dial(&self, peer: &str) -> Result<FormatStream> {
        let deadline = Instant::now() + self.shared.config.session.stream_ready_timeout;
        loop {
            match self.shared.registry.open(peer, Channel::Control).await {
                Ok(stream) => return Ok(stream),
                Err(e) if Instant::now() + DIAL_RETRY < deadline => {
                    tracing::debug!("Dialling {} failed, retrying: {}", peer, e);
                    tokio::time::sleep(DIAL_RETRY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Stop the session with a peer and wait for its tasks to finish.
    ///
    /// Returns false if there was no session.
    pub async fn end_process_for_peer(&self, peer: &str) -> bool {
        let handle = self.shared.sessions.write().await.remove(peer);
        let Some(handle) = handle else {
            return false;
        };
        handle.cancel.cancel();
        let _ = handle.task.await;
        true
    }

    /// Stop every session.
    pub async fn cancel_all_sessions(&self) {
        let handles: Vec<_> = self.shared.sessions.write().await.drain().collect();
        for (_, handle) in &handles {
            handle.cancel.cancel();
        }
        for (peer, handle) in handles {
            if handle.task.await.is_err() {
                tracing::warn!("Session task of {} panicked", peer);
            }
        }
    }

    /// Tell every connected peer that this device is leaving.
    pub async fn send_disconnect_to_all_peers(&self) {
        let outboxes: Vec<_> = self
            .shared
            .sessions
            .read()
            .await
            .iter()
            .map(|(peer, s)| (peer.clone(), s.outbox.clone()))
            .collect();

        for (peer, outbox) in outboxes {
            let message = self.shared.message(
                FmtType::TextCb,
                State::Init,
                Command::Disconnect,
                crate::now_millis(),
                ExtData::Empty,
            );
            if outbox.send(message).await.is_err() {
                tracing::debug!("Session with {} already gone", peer);
            }
        }
    }

    /// Peers with a running session, sorted.
    pub async fn active_peers(&self) -> Vec<String> {
        let mut peers: Vec<_> = self.shared.sessions.read().await.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Whether a session with the peer is running.
    pub async fn is_connected(&self, peer: &str) -> bool {
        self.shared.sessions.read().await.contains_key(peer)
    }

    async fn session_channels(
        &self,
        peer: &str,
    ) -> Result<(mpsc::Sender<Message>, mpsc::Sender<SessionEvent>)> {
        self.shared
            .sessions
            .read()
            .await
            .get(peer)
            .map(|s| (s.outbox.clone(), s.events.clone()))
            .ok_or_else(|| Error::PeerNotFound(peer.to_string()))
    }

    async fn send_to(&self, peer: &str, message: Message) -> Result<()> {
        let (outbox, _) = self.session_channels(peer).await?;
        outbox
            .send(message)
            .await
            .map_err(|_| Error::SessionClosed(peer.to_string()))
    }

    /// Offer files and folders to a peer.
    ///
    /// The transfer is queued straight away and announced by the session.
    /// Returns the transfer timestamp.
    ///
    /// # Errors
    ///
    /// Returns `PeerNotFound` without a session, `FileOpenFailed` for
    /// unreadable paths and `QueueFull` past the queue bound.
    pub async fn send_files(&self, peer: &str, paths: &[PathBuf]) -> Result<u64> {
        self.session_channels(peer).await?;

        let mut timestamp = self.shared.next_timestamp();
        while self.shared.drops.holds(peer, timestamp).await
            || self.shared.queue.contains(peer, timestamp).await
        {
            timestamp = self.shared.next_timestamp();
        }
        let descriptor = FileDropData::from_paths(paths, timestamp)?;
        if descriptor.files.is_empty() && descriptor.folders.is_empty() {
            return Err(Error::InvalidPath("nothing to send".to_string()));
        }

        self.shared
            .queue
            .enqueue(peer, descriptor.clone(), Direction::AsSrc)
            .await?;
        tracing::info!(
            "Offering {} file(s) ({}) to {} as transfer {}",
            descriptor.files.len(),
            descriptor.total_desc,
            peer,
            timestamp
        );
        self.shared.drops.submit(peer, descriptor).await;
        Ok(timestamp)
    }

    /// Answer a file-drop request from a peer.
    ///
    /// # Errors
    ///
    /// Returns `TransferNotFound` if no such request is pending.
    pub async fn respond_to_file_drop(&self, peer: &str, timestamp: u64, accept: bool) -> Result<()> {
        self.shared.drops.respond(peer, timestamp, accept).await
    }

    /// File-drop requests from a peer waiting for an answer.
    pub async fn pending_file_drops(&self, peer: &str) -> Vec<FileDropData> {
        self.shared.drops.pending(peer).await
    }

    /// Cancel a transfer on behalf of the local user.
    ///
    /// A running transfer is stopped by its task, which tells the peer. A
    /// transfer that has not moved bytes yet is withdrawn with `CANCEL`.
    ///
    /// # Errors
    ///
    /// Returns `TransferNotFound` if the transfer is unknown.
    pub async fn cancel_transfer(&self, peer: &str, timestamp: u64) -> Result<()> {
        let shared = &self.shared;
        match shared.queue.cancel(peer, timestamp, CancelOrigin::LocalUi).await {
            CancelOutcome::Signalled => {
                tracing::info!("Cancelling transfer {} with {}", timestamp, peer);
                return Ok(());
            }
            CancelOutcome::NoHandle => {
                shared.queue.dequeue(peer, timestamp).await;
                shared.drops.withdraw(peer, timestamp).await;
            }
            CancelOutcome::NotFound => {
                if !shared.drops.withdraw(peer, timestamp).await {
                    return Err(Error::TransferNotFound(timestamp));
                }
            }
        }

        tracing::info!("Withdrew transfer {} with {}", timestamp, peer);
        if let Ok((outbox, events)) = self.session_channels(peer).await {
            let message = shared.message(
                FmtType::FileDrop,
                State::Init,
                Command::Cancel,
                timestamp,
                ExtData::Cancel(CancelPayload { timestamp }),
            );
            let _ = outbox.send(message).await;
            let _ = events
                .send(SessionEvent::Forget(Exchange::FileDrop(timestamp)))
                .await;
        }
        shared.ui.notify(UiEvent::TransferCancelled {
            peer: peer.to_string(),
            timestamp,
            by_peer: false,
        });
        Ok(())
    }

    /// Ask the sender to resume an interrupted inbound transfer.
    ///
    /// The answer arrives as [`UiEvent::RecoverResult`].
    ///
    /// # Errors
    ///
    /// Returns `TransferNotFound` if there is no interrupted inbound transfer
    /// with this timestamp, and `PeerNotFound` without a session.
    pub async fn recover_transfer(&self, peer: &str, timestamp: u64) -> Result<()> {
        let record = self
            .shared
            .queue
            .interrupted(peer)
            .await
            .into_iter()
            .find(|(direction, d)| *direction == Direction::AsDst && d.timestamp == timestamp)
            .map(|(_, d)| d)
            .ok_or(Error::TransferNotFound(timestamp))?;

        tracing::info!("Asking {} to resume transfer {}", peer, timestamp);
        let message = self.shared.message(
            FmtType::FileDrop,
            State::Init,
            Command::RecoverRequest,
            timestamp,
            ExtData::RecoverRequest(record),
        );
        self.send_to(peer, message).await
    }

    /// The peer's transfer queue in FIFO order.
    pub async fn queued_transfers(&self, peer: &str) -> Vec<QueuedTransfer> {
        self.shared.queue.snapshot(peer).await
    }

    /// Interrupted transfers with a peer that may be resumed.
    pub async fn interrupted_transfers(&self, peer: &str) -> Vec<(Direction, FileDropData)> {
        self.shared.queue.interrupted(peer).await
    }

    /// Publish local clipboard content to every session.
    ///
    /// Returns `None` if the content did not change.
    pub fn publish_clipboard(&self, payload: ClipPayload) -> Option<Arc<ClipboardSnapshot>> {
        self.shared.clipboard.publish_local(payload)
    }
}
