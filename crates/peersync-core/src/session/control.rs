//! Transfer-control commands.
//!
//! Interrupts, cancels, resume requests and disconnects may arrive in any
//! state, so the control-stream reader handles them as soon as they are
//! decoded instead of routing them through the transition table.

use super::peer::SessionContext;
use super::state::Exchange;
use crate::file::InterruptInfo;
use crate::protocol::{
    Command, ExtData, FmtType, InterruptCode, InterruptPayload, Message, RecoverResponse, State,
};
use crate::queue::{CancelOrigin, Direction};
use crate::registry::Channel;
use crate::ui::{Side, UiEvent};

impl SessionContext {
    pub(super) async fn handle_control(&self, message: Message) {
        tracing::debug!("<- {}: {}", self.peer, message.describe());
        match (message.command, message.ext) {
            (command @ (Command::SrcInterrupt | Command::DstInterrupt), ExtData::Interrupt(p)) => {
                let side = if command == Command::SrcInterrupt {
                    Side::Source
                } else {
                    Side::Destination
                };
                if message.fmt == FmtType::FileDrop {
                    self.on_transfer_interrupt(side, p).await;
                } else {
                    self.on_clipboard_interrupt(message.fmt, side, p).await;
                }
            }
            (Command::Cancel, ExtData::Cancel(p)) => self.on_cancel(p.timestamp).await,
            (Command::RecoverRequest, ExtData::RecoverRequest(d)) => {
                self.on_recover_request(d).await;
            }
            (Command::RecoverResponse, ExtData::RecoverResponse(r)) => {
                self.on_recover_response(r).await;
            }
            (Command::Disconnect, _) => {
                tracing::info!("{} disconnected", self.peer);
                self.cancel.cancel();
            }
            (command, _) => {
                tracing::warn!("Dropped malformed {} from {}", command, self.peer);
            }
        }
    }

    async fn on_transfer_interrupt(&self, side: Side, payload: InterruptPayload) {
        let timestamp = payload.timestamp;
        let queue = &self.shared.queue;

        let entry = queue.entry(&self.peer, timestamp).await;
        let was_pending = self.shared.drops.withdraw(&self.peer, timestamp).await;
        if entry.is_none() && !was_pending {
            tracing::debug!(
                "Ignoring interrupt of finished transfer {} from {}",
                timestamp,
                self.peer
            );
            return;
        }

        tracing::warn!(
            "{} interrupted transfer {} ({}): {}",
            self.peer,
            timestamp,
            payload.code,
            payload.detail
        );

        if let Some(entry) = entry {
            queue.cancel(&self.peer, timestamp, CancelOrigin::Remote).await;
            queue.dequeue(&self.peer, timestamp).await;

            if payload.code != InterruptCode::Cancelled {
                let mut record = entry.descriptor;
                record.interrupt = Some(InterruptInfo {
                    last_file: payload.last_file.clone(),
                    offset: payload.offset,
                    last_error: payload.code,
                });
                queue
                    .record_interrupted(&self.peer, entry.direction, record)
                    .await;
            }
        }

        self.shared
            .registry
            .close(&self.peer, Channel::FileDrop(timestamp))
            .await;
        self.forget(Exchange::FileDrop(timestamp)).await;

        self.notify(UiEvent::TransferFailed {
            peer: self.peer.clone(),
            timestamp,
            format: FmtType::FileDrop,
            side,
            code: payload.code,
            cancelled_locally: false,
            detail: payload.detail,
        });
    }

    async fn on_clipboard_interrupt(&self, fmt: FmtType, side: Side, payload: InterruptPayload) {
        tracing::warn!(
            "{} interrupted {} clipboard exchange ({}): {}",
            self.peer,
            fmt,
            payload.code,
            payload.detail
        );
        if let Some(handle) = self.untrack_clipboard(fmt, payload.timestamp).await {
            handle.cancel(CancelOrigin::Remote);
        }
        self.shared
            .registry
            .close(&self.peer, Channel::Clipboard(fmt, payload.timestamp))
            .await;
        self.forget(Exchange::Clipboard(fmt)).await;

        self.notify(UiEvent::TransferFailed {
            peer: self.peer.clone(),
            timestamp: payload.timestamp,
            format: fmt,
            side,
            code: payload.code,
            cancelled_locally: false,
            detail: payload.detail,
        });
    }

    async fn on_cancel(&self, timestamp: u64) {
        let queue = &self.shared.queue;
        let queued = queue.contains(&self.peer, timestamp).await;
        if queued {
            queue.cancel(&self.peer, timestamp, CancelOrigin::Remote).await;
            queue.dequeue(&self.peer, timestamp).await;
        }
        let was_pending = self.shared.drops.withdraw(&self.peer, timestamp).await;

        self.shared
            .registry
            .close(&self.peer, Channel::FileDrop(timestamp))
            .await;
        self.forget(Exchange::FileDrop(timestamp)).await;

        if queued || was_pending {
            tracing::info!("{} withdrew transfer {}", self.peer, timestamp);
            self.notify(UiEvent::TransferCancelled {
                peer: self.peer.clone(),
                timestamp,
                by_peer: true,
            });
        }
    }

    async fn on_recover_request(&self, request: crate::file::FileDropData) {
        let timestamp = request.timestamp;
        let queue = &self.shared.queue;

        let record = match queue.take_interrupted(&self.peer, timestamp).await {
            Some((Direction::AsSrc, record)) => Some(record),
            Some((direction, record)) => {
                queue.record_interrupted(&self.peer, direction, record).await;
                None
            }
            None => None,
        };

        let resumed = match record {
            Some(record) => {
                let last_file = record
                    .interrupt
                    .as_ref()
                    .or(request.interrupt.as_ref())
                    .map(|i| i.last_file.clone())
                    .unwrap_or_default();
                let remaining = record.remaining_from(&last_file);
                match queue
                    .enqueue(&self.peer, remaining.clone(), Direction::AsSrc)
                    .await
                {
                    Ok(_) => Some(remaining),
                    Err(e) => {
                        tracing::warn!("Cannot resume transfer {}: {}", timestamp, e);
                        queue
                            .record_interrupted(&self.peer, Direction::AsSrc, record)
                            .await;
                        None
                    }
                }
            }
            None => None,
        };

        let accepted = resumed.is_some();
        let answer = self.message(
            FmtType::FileDrop,
            State::Init,
            Command::RecoverResponse,
            timestamp,
            ExtData::RecoverResponse(RecoverResponse {
                timestamp,
                accepted,
            }),
        );
        if self.send(answer).await.is_err() {
            return;
        }

        if let Some(remaining) = resumed {
            tracing::info!(
                "Resuming transfer {} to {} with {} file(s)",
                timestamp,
                self.peer,
                remaining.files.len()
            );
            self.shared
                .registry
                .listen(&self.peer, Channel::FileDrop(timestamp))
                .await;
            self.spawn_send(remaining);
        } else {
            tracing::info!("Declined to resume transfer {} for {}", timestamp, self.peer);
        }
    }

    async fn on_recover_response(&self, response: RecoverResponse) {
        let timestamp = response.timestamp;
        let record = self
            .shared
            .queue
            .take_interrupted(&self.peer, timestamp)
            .await;

        match record {
            Some((Direction::AsDst, record)) if response.accepted => {
                tracing::info!("{} resumes transfer {}", self.peer, timestamp);
                self.shared.drops.accept(&self.peer, record).await;
            }
            Some((direction, record)) if direction == Direction::AsSrc => {
                self.shared
                    .queue
                    .record_interrupted(&self.peer, direction, record)
                    .await;
            }
            _ => {
                tracing::info!("{} will not resume transfer {}", self.peer, timestamp);
            }
        }

        self.notify(UiEvent::RecoverResult {
            peer: self.peer.clone(),
            timestamp,
            accepted: response.accepted,
        });
    }
}
