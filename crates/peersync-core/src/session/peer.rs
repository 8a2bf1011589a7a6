//! The per-peer session loop and its event sources.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::drops::DropEvent;
use super::engine::{SessionHandle, Shared};
use super::state::{Exchange, ExchangeStates};
use crate::clipboard::{build_payload, ClipPayload, ClipboardSnapshot};
use crate::error::{Error, ErrorKind, Result};
use crate::file::{DropCmd, FileDropData};
use crate::protocol::{
    read_frame, timed, write_frame, ClipboardHeader, Command, DropResponse, ExtData, FmtType,
    Frame, FrameKind, InterruptCode, InterruptPayload, Message, Role, State, TextPayload,
};
use crate::queue::CancelHandle;
use crate::registry::{Channel, FormatStream};
use crate::ui::UiEvent;

/// Input of the session loop.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// The local clipboard changed
    Clipboard(Arc<ClipboardSnapshot>),
    /// A file-drop request or answer from the host
    Drop(DropEvent),
    /// A state-machine message from the peer
    Inbound(Message),
    /// An exchange ended outside the loop
    Forget(Exchange),
}

/// Everything the tasks of one session share.
#[derive(Clone)]
pub(super) struct SessionContext {
    pub(super) shared: Arc<Shared>,
    pub(super) peer: String,
    pub(super) cancel: CancellationToken,
    outbox: mpsc::Sender<Message>,
    events: mpsc::Sender<SessionEvent>,
    clipboard_transfers: Arc<Mutex<HashMap<(FmtType, u64), CancelHandle>>>,
}

impl SessionContext {
    pub(super) fn message(
        &self,
        fmt: FmtType,
        state: State,
        command: Command,
        timestamp: u64,
        ext: ExtData,
    ) -> Message {
        self.shared.message(fmt, state, command, timestamp, ext)
    }

    /// Queue a message for the control stream.
    pub(super) async fn send(&self, message: Message) -> Result<()> {
        tracing::debug!("-> {}: {}", self.peer, message.describe());
        self.outbox
            .send(message)
            .await
            .map_err(|_| Error::SessionClosed(self.peer.clone()))
    }

    /// Tell the peer a transfer stopped on our side.
    pub(super) async fn send_interrupt(&self, fmt: FmtType, role: Role, payload: InterruptPayload) {
        let command = match role {
            Role::Src => Command::SrcInterrupt,
            Role::Dst => Command::DstInterrupt,
        };
        let message = self.message(
            fmt,
            State::Io,
            command,
            payload.timestamp,
            ExtData::Interrupt(payload),
        );
        if let Err(e) = self.send(message).await {
            tracing::debug!("Could not report interrupt to {}: {}", self.peer, e);
        }
    }

    /// Ask the loop to drop an exchange's state.
    pub(super) async fn forget(&self, exchange: Exchange) {
        let _ = self.events.send(SessionEvent::Forget(exchange)).await;
    }

    pub(super) async fn track_clipboard(&self, fmt: FmtType, timestamp: u64, handle: CancelHandle) {
        self.clipboard_transfers
            .lock()
            .await
            .insert((fmt, timestamp), handle);
    }

    pub(super) async fn untrack_clipboard(&self, fmt: FmtType, timestamp: u64) -> Option<CancelHandle> {
        self.clipboard_transfers
            .lock()
            .await
            .remove(&(fmt, timestamp))
    }

    pub(super) fn notify(&self, event: UiEvent) {
        self.shared.ui.notify(event);
    }
}

/// An image or bundle announced to the peer and not yet streamed.
struct OutgoingClip {
    timestamp: u64,
    header: ClipboardHeader,
    data: Vec<u8>,
}

/// State owned by the session loop.
pub(super) struct PeerSession {
    ctx: SessionContext,
    id: u64,
    states: ExchangeStates,
    outgoing: HashMap<FmtType, OutgoingClip>,
}

impl PeerSession {
    /// Start every task of a session over an established control stream.
    pub(super) fn spawn(
        shared: Arc<Shared>,
        peer: &str,
        id: u64,
        control: FormatStream,
        cancel: CancellationToken,
    ) -> SessionHandle {
        let buffer = shared.config.session.event_buffer;
        let (outbox_tx, outbox_rx) = mpsc::channel(buffer);
        let (events_tx, events_rx) = mpsc::channel(buffer);
        let clipboard_enabled = shared.config.clipboard.enabled;

        let ctx = SessionContext {
            shared,
            peer: peer.to_string(),
            cancel: cancel.clone(),
            outbox: outbox_tx.clone(),
            events: events_tx.clone(),
            clipboard_transfers: Arc::new(Mutex::new(HashMap::new())),
        };

        let (reader, writer) = tokio::io::split(control);
        let mut sources = vec![
            spawn_writer(ctx.clone(), writer, outbox_rx),
            spawn_reader(ctx.clone(), reader),
            spawn_drop_watcher(ctx.clone()),
        ];
        if clipboard_enabled {
            sources.push(spawn_clipboard_watcher(ctx.clone()));
        }

        let session = Self {
            ctx,
            id,
            states: ExchangeStates::new(),
            outgoing: HashMap::new(),
        };
        let task = tokio::spawn(session.run(events_rx, sources));

        SessionHandle {
            id,
            cancel,
            outbox: outbox_tx,
            events: events_tx,
            task,
        }
    }

    async fn run(mut self, mut events: mpsc::Receiver<SessionEvent>, sources: Vec<JoinHandle<()>>) {
        let peer = self.ctx.peer.clone();
        tracing::info!("Session with {} started", peer);
        self.ctx.notify(UiEvent::PeerConnected { peer: peer.clone() });

        loop {
            tokio::select! {
                biased;
                () = self.ctx.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }

        self.ctx.cancel.cancel();
        drop(events);
        for source in sources {
            let _ = source.await;
        }

        let shared = &self.ctx.shared;
        let running = shared.queue.clear_peer(&peer).await;
        if !running.is_empty() {
            tracing::debug!("Stopped {} running transfer(s) with {}", running.len(), peer);
        }
        shared.drops.clear_peer(&peer).await;
        shared.registry.remove_peer(&peer).await;
        shared.detach_session(&peer, self.id).await;

        tracing::info!("Session with {} ended", peer);
        self.ctx.notify(UiEvent::PeerDisconnected { peer });
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        let (what, result) = match event {
            SessionEvent::Clipboard(snapshot) => (
                format!("clipboard change {}", snapshot.timestamp),
                self.announce_clipboard(&snapshot).await,
            ),
            SessionEvent::Drop(DropEvent::Outbound(descriptor)) => (
                format!("file drop {}", descriptor.timestamp),
                self.announce_drop(descriptor).await,
            ),
            SessionEvent::Drop(DropEvent::Response {
                timestamp,
                accepted,
            }) => (
                format!("answer to file drop {timestamp}"),
                self.answer_drop(timestamp, accepted).await,
            ),
            SessionEvent::Inbound(message) => (message.describe(), self.handle_message(message).await),
            SessionEvent::Forget(exchange) => {
                self.states.forget(exchange);
                return;
            }
        };

        let Err(e) = result else {
            return;
        };
        if e.kind() == ErrorKind::Protocol {
            tracing::warn!("Dropped {} for {}: {}", what, self.ctx.peer, e);
        } else {
            tracing::warn!("Handling {} for {} failed: {}", what, self.ctx.peer, e);
            self.ctx.notify(UiEvent::Error {
                peer: Some(self.ctx.peer.clone()),
                message: e.to_string(),
            });
        }
    }

    async fn peer_supports_extended(&self) -> bool {
        self.ctx.shared.config.clipboard.extended_format
            && self
                .ctx
                .shared
                .roster
                .get(&self.ctx.peer)
                .await
                .is_some_and(|info| info.supports_extended_clipboard)
    }

    async fn announce_clipboard(&mut self, snapshot: &ClipboardSnapshot) -> Result<()> {
        let (fmt, ext) = match &snapshot.payload {
            ClipPayload::Text(text) => (
                FmtType::TextCb,
                ExtData::Text(TextPayload { text: text.clone() }),
            ),
            ClipPayload::Bundle(bundle) => {
                let extended = self.peer_supports_extended().await;
                if !extended && bundle.image.is_empty() {
                    let text = String::from_utf8_lossy(&bundle.text).to_string();
                    (FmtType::TextCb, ExtData::Text(TextPayload { text }))
                } else {
                    let fmt = if extended {
                        FmtType::XclipCb
                    } else {
                        FmtType::ImageCb
                    };
                    let (header, data) = build_payload(snapshot, fmt)?;
                    self.outgoing.insert(
                        fmt,
                        OutgoingClip {
                            timestamp: snapshot.timestamp,
                            header,
                            data,
                        },
                    );
                    (fmt, ExtData::ClipboardHeader(header))
                }
            }
        };

        let exchange = Exchange::Clipboard(fmt);
        self.states.advance(exchange, (State::Init, Role::Src))?;
        self.states.advance(exchange, (State::Info, Role::Src))?;
        self.ctx
            .send(self.ctx.message(fmt, State::Info, Command::Src, snapshot.timestamp, ext))
            .await
    }

    async fn announce_drop(&mut self, descriptor: FileDropData) -> Result<()> {
        let timestamp = descriptor.timestamp;
        if !self.ctx.shared.queue.contains(&self.ctx.peer, timestamp).await {
            tracing::debug!("Transfer {} was withdrawn before it was offered", timestamp);
            return Ok(());
        }

        let exchange = Exchange::FileDrop(timestamp);
        self.states.advance(exchange, (State::Init, Role::Src))?;
        self.states.advance(exchange, (State::Info, Role::Src))?;
        self.ctx
            .send(self.ctx.message(
                FmtType::FileDrop,
                State::Info,
                Command::Src,
                timestamp,
                ExtData::FileDrop(descriptor),
            ))
            .await
    }

    async fn answer_drop(&mut self, timestamp: u64, accepted: bool) -> Result<()> {
        let exchange = Exchange::FileDrop(timestamp);
        self.states.advance(exchange, (State::Trans, Role::Dst))?;
        if !accepted {
            self.states.forget(exchange);
        }

        let download_dir = self.ctx.shared.config.general.resolved_download_dir();
        let response = DropResponse {
            timestamp,
            cmd: if accepted {
                DropCmd::Accept
            } else {
                DropCmd::Reject
            },
            dst_path: Some(download_dir.display().to_string()),
        };
        tracing::info!(
            "{} transfer {} from {}",
            if accepted { "Accepted" } else { "Rejected" },
            timestamp,
            self.ctx.peer
        );
        self.ctx
            .send(self.ctx.message(
                FmtType::FileDrop,
                State::Trans,
                Command::Dst,
                timestamp,
                ExtData::DropResponse(response),
            ))
            .await
    }

    async fn handle_message(&mut self, message: Message) -> Result<()> {
        tracing::debug!("<- {}: {}", self.ctx.peer, message.describe());
        let Some(role) = message.command.role() else {
            return Err(Error::Protocol(format!(
                "{} is not a state transition",
                message.command
            )));
        };

        match (message.fmt, message.state, role) {
            (FmtType::TextCb, State::Info, Role::Src) => self.receive_text(message),
            (FmtType::ImageCb | FmtType::XclipCb, State::Info, Role::Src) => {
                self.clipboard_offered(message).await
            }
            (FmtType::ImageCb | FmtType::XclipCb, State::Trans, Role::Dst) => {
                self.clipboard_wanted(&message).await
            }
            (FmtType::ImageCb | FmtType::XclipCb, State::Io, Role::Src) => {
                self.clipboard_incoming(message).await
            }
            (FmtType::FileDrop, State::Info, Role::Src) => self.drop_offered(message).await,
            (FmtType::FileDrop, State::Trans, Role::Dst) => self.drop_answered(message).await,
            (FmtType::FileDrop, State::Io, Role::Src) => self.drop_incoming(message).await,
            _ => Err(Error::Protocol(format!(
                "unexpected {}",
                message.describe()
            ))),
        }
    }

    fn receive_text(&mut self, message: Message) -> Result<()> {
        let exchange = Exchange::of(&message);
        let ExtData::Text(payload) = message.ext else {
            return Err(Error::Protocol("text clipboard without text".to_string()));
        };
        self.states.advance(exchange, (State::Info, Role::Dst))?;

        let bytes = payload.text.len() as u64;
        self.ctx
            .shared
            .clipboard
            .apply_remote(&self.ctx.peer, ClipPayload::Text(payload.text))?;
        self.ctx.notify(UiEvent::ClipboardReceived {
            peer: self.ctx.peer.clone(),
            format: FmtType::TextCb,
            bytes,
        });
        Ok(())
    }

    async fn clipboard_offered(&mut self, message: Message) -> Result<()> {
        let exchange = Exchange::of(&message);
        let ExtData::ClipboardHeader(header) = message.ext else {
            return Err(Error::Protocol("clipboard offer without header".to_string()));
        };
        let total = header.total_len()?;
        self.states.advance(exchange, (State::Info, Role::Dst))?;

        let limit = self.ctx.shared.config.clipboard.max_payload_bytes;
        if total > limit {
            self.states.forget(exchange);
            self.ctx
                .send_interrupt(
                    message.fmt,
                    Role::Dst,
                    InterruptPayload {
                        timestamp: message.timestamp,
                        code: InterruptCode::NotAccepted,
                        last_file: String::new(),
                        offset: 0,
                        detail: format!("{total} bytes exceeds limit of {limit}"),
                    },
                )
                .await;
            return Ok(());
        }

        self.states.advance(exchange, (State::Trans, Role::Dst))?;
        self.ctx
            .send(self.ctx.message(
                message.fmt,
                State::Trans,
                Command::Dst,
                message.timestamp,
                ExtData::Empty,
            ))
            .await
    }

    async fn clipboard_wanted(&mut self, message: &Message) -> Result<()> {
        let exchange = Exchange::of(message);
        let fresh = self
            .outgoing
            .get(&message.fmt)
            .is_some_and(|clip| clip.timestamp == message.timestamp);
        if !fresh {
            return Err(Error::Protocol(format!(
                "no {} content announced at {}",
                message.fmt, message.timestamp
            )));
        }

        self.states.advance(exchange, (State::Trans, Role::Src))?;
        self.states.advance(exchange, (State::Io, Role::Src))?;
        let Some(clip) = self.outgoing.remove(&message.fmt) else {
            return Err(Error::Internal("announced clipboard vanished".to_string()));
        };
        self.ctx
            .shared
            .registry
            .listen(&self.ctx.peer, Channel::Clipboard(message.fmt, clip.timestamp))
            .await;

        self.ctx
            .send(self.ctx.message(
                message.fmt,
                State::Io,
                Command::Src,
                clip.timestamp,
                ExtData::ClipboardHeader(clip.header),
            ))
            .await?;
        self.ctx
            .spawn_clipboard_send(message.fmt, clip.timestamp, clip.data);
        Ok(())
    }

    async fn clipboard_incoming(&mut self, message: Message) -> Result<()> {
        let exchange = Exchange::of(&message);
        let ExtData::ClipboardHeader(header) = message.ext else {
            return Err(Error::Protocol("clipboard transfer without header".to_string()));
        };
        self.states.advance(exchange, (State::Io, Role::Dst))?;
        self.ctx
            .spawn_clipboard_receive(message.fmt, message.timestamp, header);
        Ok(())
    }

    async fn drop_offered(&mut self, message: Message) -> Result<()> {
        let exchange = Exchange::of(&message);
        let ExtData::FileDrop(descriptor) = message.ext else {
            return Err(Error::Protocol("file drop without descriptor".to_string()));
        };
        let timestamp = message.timestamp;
        if descriptor.timestamp != timestamp {
            return Err(Error::Protocol(format!(
                "file drop {timestamp} describes transfer {}",
                descriptor.timestamp
            )));
        }

        let peer = &self.ctx.peer;
        let shared = &self.ctx.shared;
        let in_use = self.states.current(exchange).is_some()
            || shared.queue.contains(peer, timestamp).await
            || shared.drops.holds(peer, timestamp).await;
        if in_use {
            tracing::warn!(
                "{} offered transfer {} while that transfer id is in use",
                peer,
                timestamp
            );
            self.ctx
                .send_interrupt(
                    FmtType::FileDrop,
                    Role::Dst,
                    InterruptPayload {
                        timestamp,
                        code: InterruptCode::QueueFull,
                        last_file: String::new(),
                        offset: 0,
                        detail: format!("transfer {timestamp} is already in progress"),
                    },
                )
                .await;
            return Ok(());
        }
        self.states.advance(exchange, (State::Info, Role::Dst))?;

        tracing::info!(
            "{} offers {} file(s) ({}) as transfer {}",
            peer,
            descriptor.files.len(),
            descriptor.total_desc,
            timestamp
        );
        shared.drops.add_pending(peer, descriptor.clone()).await;

        if shared.config.transfer.auto_accept {
            shared.drops.respond(peer, timestamp, true).await
        } else {
            self.ctx.notify(UiEvent::FileDropRequest {
                peer: peer.clone(),
                descriptor,
            });
            Ok(())
        }
    }

    async fn drop_answered(&mut self, message: Message) -> Result<()> {
        let exchange = Exchange::of(&message);
        let ExtData::DropResponse(response) = message.ext else {
            return Err(Error::Protocol("file drop answer without response".to_string()));
        };
        let timestamp = message.timestamp;
        let peer = self.ctx.peer.clone();
        let shared = Arc::clone(&self.ctx.shared);

        if response.cmd != DropCmd::Accept {
            self.states.forget(exchange);
            shared.queue.dequeue(&peer, timestamp).await;
            tracing::info!("{} rejected transfer {}", peer, timestamp);
            self.ctx.notify(UiEvent::TransferRejected { peer, timestamp });
            return Ok(());
        }

        let descriptor = shared
            .queue
            .descriptor(&peer, timestamp)
            .await
            .ok_or(Error::TransferNotFound(timestamp))?;

        self.states.advance(exchange, (State::Trans, Role::Src))?;
        shared
            .registry
            .listen(&peer, Channel::FileDrop(timestamp))
            .await;
        self.states.advance(exchange, (State::Io, Role::Src))?;
        self.states.forget(exchange);

        tracing::debug!(
            "{} accepted transfer {} into {}",
            peer,
            timestamp,
            response.dst_path.as_deref().unwrap_or("its download folder")
        );
        self.ctx.spawn_send(descriptor);
        Ok(())
    }

    async fn drop_incoming(&mut self, message: Message) -> Result<()> {
        let exchange = Exchange::of(&message);
        let timestamp = message.timestamp;
        self.states.advance(exchange, (State::Io, Role::Dst))?;
        self.states.forget(exchange);

        let peer = &self.ctx.peer;
        let Some(accepted) = self.ctx.shared.drops.take_accepted(peer, timestamp).await else {
            self.ctx
                .send_interrupt(
                    FmtType::FileDrop,
                    Role::Dst,
                    InterruptPayload {
                        timestamp,
                        code: InterruptCode::NotAccepted,
                        last_file: String::new(),
                        offset: 0,
                        detail: "transfer was not accepted".to_string(),
                    },
                )
                .await;
            return Err(Error::Protocol(format!(
                "transfer {timestamp} was never accepted"
            )));
        };

        // A resumed transfer carries the remaining files; a fresh one must
        // match what the user accepted.
        let descriptor = match message.ext {
            ExtData::FileDrop(resumed) if accepted.interrupt.is_some() => resumed,
            _ => accepted,
        };
        self.ctx.spawn_receive(descriptor);
        Ok(())
    }
}

fn spawn_writer(
    ctx: SessionContext,
    mut writer: WriteHalf<FormatStream>,
    mut outbox: mpsc::Receiver<Message>,
) -> JoinHandle<()> {
    let io_timeout = ctx.shared.config.session.io_timeout;
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                biased;
                message = outbox.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
                () = ctx.cancel.cancelled() => break,
            };

            let result = match message.encode() {
                Ok(body) => {
                    let frame = Frame::new(FrameKind::Envelope, body);
                    timed(io_timeout, write_frame(&mut writer, &frame)).await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => tracing::trace!("Wrote {} to {}", message.describe(), ctx.peer),
                Err(e) if e.kind() == ErrorKind::Protocol => {
                    tracing::warn!("Could not encode {}: {}", message.describe(), e);
                }
                Err(e) => {
                    tracing::warn!("Control stream to {} failed: {}", ctx.peer, e);
                    ctx.cancel.cancel();
                    break;
                }
            }
        }
        let _ = writer.shutdown().await;
    })
}

fn spawn_reader(ctx: SessionContext, mut reader: ReadHalf<FormatStream>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                () = ctx.cancel.cancelled() => break,
                frame = read_frame(&mut reader) => frame,
            };

            let payload = match frame {
                Ok(frame) if frame.kind == FrameKind::Envelope => frame.body,
                Ok(frame) => {
                    tracing::warn!("Dropped {:?} frame from {}", frame.kind, ctx.peer);
                    continue;
                }
                Err(e) => {
                    tracing::info!("Control stream of {} closed: {}", ctx.peer, e);
                    ctx.cancel.cancel();
                    break;
                }
            };

            let message = match Message::decode(&payload) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!("Dropped undecodable message from {}: {}", ctx.peer, e);
                    continue;
                }
            };

            if message.command.is_control() {
                ctx.handle_control(message).await;
            } else if ctx.events.send(SessionEvent::Inbound(message)).await.is_err() {
                break;
            }
        }
    })
}

fn spawn_clipboard_watcher(ctx: SessionContext) -> JoinHandle<()> {
    let mut changes = ctx.shared.clipboard.subscribe();
    tokio::spawn(async move {
        let mut last_seen: Option<(u64, u64)> = None;
        loop {
            tokio::select! {
                () = ctx.cancel.cancelled() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            let Some(snapshot) = changes.borrow_and_update().clone() else {
                continue;
            };
            if snapshot.source_id != ctx.shared.identity.id {
                continue;
            }
            let key = (snapshot.hash, snapshot.timestamp);
            if last_seen == Some(key) {
                continue;
            }
            last_seen = Some(key);

            if ctx.events.send(SessionEvent::Clipboard(snapshot)).await.is_err() {
                break;
            }
        }
    })
}

fn spawn_drop_watcher(ctx: SessionContext) -> JoinHandle<()> {
    let poll = ctx.shared.config.session.file_drop_poll_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(poll);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = ctx.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            for event in ctx.shared.drops.take_events(&ctx.peer).await {
                if ctx.events.send(SessionEvent::Drop(event)).await.is_err() {
                    return;
                }
            }
        }
    })
}
