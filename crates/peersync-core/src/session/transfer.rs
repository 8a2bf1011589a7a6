//! Transfer tasks spawned by a session.
//!
//! A file drop runs on its own format stream: the source waits for a queue
//! slot, checks that its files are still there, announces `IO`, then waits
//! for the destination to open the stream.
//! Clipboard payloads take the same path without queueing.

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::peer::SessionContext;
use crate::clipboard::{receive_clipboard, send_clipboard, split_payload, ClipPayload};
use crate::error::{Error, Result};
use crate::file::{
    progress::spawn_progress_ticker, receive_files, send_files, verify_sources, CopyOptions,
    FileDropData, InterruptInfo, ProgressReporter,
};
use crate::protocol::{
    ClipboardHeader, Command, ExtData, FmtType, InterruptPayload, Role, State,
};
use crate::queue::{CancelHandle, Direction};
use crate::registry::Channel;
use crate::ui::{Side, UiEvent};

const fn side_of(direction: Direction) -> (Side, Role) {
    match direction {
        Direction::AsSrc => (Side::Source, Role::Src),
        Direction::AsDst => (Side::Destination, Role::Dst),
    }
}

impl SessionContext {
    fn copy_options(&self) -> CopyOptions {
        CopyOptions {
            chunk_size: self.shared.config.transfer.chunk_size,
            io_timeout: self.shared.config.session.io_timeout,
        }
    }

    /// Send an accepted file drop.
    pub(super) fn spawn_send(&self, descriptor: FileDropData) {
        let ctx = self.clone();
        tokio::spawn(async move {
            let timestamp = descriptor.timestamp;
            let handle = CancelHandle::child_of(&ctx.cancel, &ctx.peer);
            if !ctx
                .shared
                .queue
                .set_cancel_handle(&ctx.peer, timestamp, handle.clone())
                .await
            {
                tracing::debug!("Transfer {} left the queue before it started", timestamp);
                ctx.shared
                    .registry
                    .close(&ctx.peer, Channel::FileDrop(timestamp))
                    .await;
                return;
            }

            let reporter = ProgressReporter::new(&ctx.peer, &descriptor, Direction::AsSrc);
            match ctx.run_send(&descriptor, &handle, &reporter).await {
                Ok(()) => ctx.complete_transfer(timestamp, Direction::AsSrc, Vec::new()).await,
                Err(e) => {
                    let e = handle.resolve(e);
                    ctx.fail_transfer(&descriptor, Direction::AsSrc, &reporter, true, e)
                        .await;
                }
            }
        });
    }

    async fn run_send(
        &self,
        descriptor: &FileDropData,
        handle: &CancelHandle,
        reporter: &ProgressReporter,
    ) -> Result<()> {
        let shared = &self.shared;
        let timestamp = descriptor.timestamp;
        let channel = Channel::FileDrop(timestamp);

        let result: Result<()> = async {
            shared
                .queue
                .wait_for_slot(&self.peer, timestamp, handle.token())
                .await?;
            verify_sources(descriptor).await?;

            self.send(self.message(
                FmtType::FileDrop,
                State::Io,
                Command::Src,
                timestamp,
                ExtData::FileDrop(descriptor.clone()),
            ))
            .await?;

            let mut stream = shared
                .registry
                .ensure_ready(
                    &self.peer,
                    channel,
                    shared.config.session.stream_ready_timeout,
                    handle.token(),
                )
                .await?;

            tracing::info!(
                "Sending transfer {} to {}: {} file(s), {}",
                timestamp,
                self.peer,
                descriptor.files.len(),
                descriptor.total_desc
            );
            let stop = CancellationToken::new();
            let ticker = spawn_progress_ticker(
                reporter,
                shared.ui.clone(),
                shared.config.transfer.progress_tick,
                stop.clone(),
            );
            let sent = send_files(&mut stream, descriptor, handle, &self.copy_options(), reporter).await;
            stop.cancel();
            let _ = ticker.await;

            sent?;
            let _ = stream.shutdown().await;
            Ok(())
        }
        .await;

        shared.registry.close(&self.peer, channel).await;
        result
    }

    /// Receive an accepted file drop announced by the peer.
    pub(super) fn spawn_receive(&self, descriptor: FileDropData) {
        let ctx = self.clone();
        tokio::spawn(async move {
            let reporter = ProgressReporter::new(&ctx.peer, &descriptor, Direction::AsDst);
            let (handle, result) = ctx.run_receive(&descriptor, &reporter).await;
            match result {
                Ok(files) => {
                    ctx.complete_transfer(descriptor.timestamp, Direction::AsDst, files)
                        .await;
                }
                Err(e) => {
                    let queued = handle.is_some();
                    let e = match handle {
                        Some(handle) => handle.resolve(e),
                        None => e,
                    };
                    ctx.fail_transfer(&descriptor, Direction::AsDst, &reporter, queued, e)
                        .await;
                }
            }
        });
    }

    async fn run_receive(
        &self,
        descriptor: &FileDropData,
        reporter: &ProgressReporter,
    ) -> (Option<CancelHandle>, Result<Vec<std::path::PathBuf>>) {
        let shared = &self.shared;
        let timestamp = descriptor.timestamp;
        let channel = Channel::FileDrop(timestamp);

        let mut stream = match shared.registry.open(&self.peer, channel).await {
            Ok(stream) => stream,
            Err(e) => return (None, Err(e)),
        };

        if let Err(e) = shared
            .queue
            .enqueue(&self.peer, descriptor.clone(), Direction::AsDst)
            .await
        {
            shared.registry.close(&self.peer, channel).await;
            return (None, Err(e));
        }

        let handle = CancelHandle::child_of(&self.cancel, &self.peer);
        shared
            .queue
            .set_cancel_handle(&self.peer, timestamp, handle.clone())
            .await;

        let result = async {
            shared
                .queue
                .wait_for_slot(&self.peer, timestamp, handle.token())
                .await?;

            let dst_dir = shared.config.general.resolved_download_dir();
            tracing::info!(
                "Receiving transfer {} from {} into {}",
                timestamp,
                self.peer,
                dst_dir.display()
            );

            let stop = CancellationToken::new();
            let ticker = spawn_progress_ticker(
                reporter,
                shared.ui.clone(),
                shared.config.transfer.progress_tick,
                stop.clone(),
            );
            let received = receive_files(
                &mut stream,
                descriptor,
                &dst_dir,
                &handle,
                &self.copy_options(),
                reporter,
                |path| {
                    self.notify(UiEvent::FolderCreated {
                        peer: self.peer.clone(),
                        timestamp,
                        path: path.to_path_buf(),
                    });
                },
            )
            .await;
            stop.cancel();
            let _ = ticker.await;
            received
        }
        .await;

        shared.registry.close(&self.peer, channel).await;
        (Some(handle), result)
    }

    async fn complete_transfer(
        &self,
        timestamp: u64,
        direction: Direction,
        files: Vec<std::path::PathBuf>,
    ) {
        self.shared.queue.dequeue(&self.peer, timestamp).await;
        tracing::info!(
            "Transfer {} ({}) with {} complete",
            timestamp,
            direction,
            self.peer
        );
        self.notify(UiEvent::TransferCompleted {
            peer: self.peer.clone(),
            timestamp,
            direction,
            files,
        });
    }

    /// Wind down a failed transfer: tell the peer, keep a resumable record
    /// and report to the UI.
    ///
    /// `queued` is false when the transfer never got its own queue entry. The
    /// queue is then left alone, since an entry under the same timestamp
    /// belongs to another transfer.
    async fn fail_transfer(
        &self,
        descriptor: &FileDropData,
        direction: Direction,
        reporter: &ProgressReporter,
        queued: bool,
        err: Error,
    ) {
        let shared = &self.shared;
        let timestamp = descriptor.timestamp;
        let (side, role) = side_of(direction);
        let code = err.interrupt_code();
        let progress = reporter.snapshot();

        let peer_knows = matches!(err, Error::CancelledRemote | Error::SessionClosed(_));
        if !peer_knows {
            self.send_interrupt(
                FmtType::FileDrop,
                role,
                InterruptPayload {
                    timestamp,
                    code,
                    last_file: progress.current_file_name.clone(),
                    offset: progress.file_bytes_transferred,
                    detail: err.to_string(),
                },
            )
            .await;
        }

        if !err.is_cancellation() && !matches!(err, Error::DuplicateTransfer(_)) {
            let mut record = descriptor.clone();
            record.interrupt = Some(InterruptInfo {
                last_file: progress.current_file_name,
                offset: progress.file_bytes_transferred,
                last_error: code,
            });
            shared
                .queue
                .record_interrupted(&self.peer, direction, record)
                .await;
        }

        let mut cancelled_locally = matches!(err, Error::CancelledLocal);
        if queued {
            cancelled_locally |= shared.queue.cancelled_by_local_ui(&self.peer, timestamp).await;
            shared.queue.dequeue(&self.peer, timestamp).await;
        }

        if matches!(err, Error::CancelledRemote) {
            tracing::debug!("Transfer {} stopped by {}", timestamp, self.peer);
            return;
        }
        tracing::warn!(
            "Transfer {} ({}) with {} failed: {}",
            timestamp,
            direction,
            self.peer,
            err
        );
        self.notify(UiEvent::TransferFailed {
            peer: self.peer.clone(),
            timestamp,
            format: FmtType::FileDrop,
            side,
            code,
            cancelled_locally,
            detail: err.to_string(),
        });
    }

    /// Stream an announced clipboard payload once the peer opens the stream.
    pub(super) fn spawn_clipboard_send(&self, fmt: FmtType, timestamp: u64, data: Vec<u8>) {
        let ctx = self.clone();
        tokio::spawn(async move {
            let handle = CancelHandle::child_of(&ctx.cancel, &ctx.peer);
            ctx.track_clipboard(fmt, timestamp, handle.clone()).await;

            let shared = &ctx.shared;
            let channel = Channel::Clipboard(fmt, timestamp);
            let result = async {
                let mut stream = shared
                    .registry
                    .ensure_ready(
                        &ctx.peer,
                        channel,
                        shared.config.session.stream_ready_timeout,
                        handle.token(),
                    )
                    .await?;
                send_clipboard(&mut stream, &data, shared.config.session.io_timeout).await
            }
            .await;

            shared.registry.close(&ctx.peer, channel).await;
            ctx.untrack_clipboard(fmt, timestamp).await;
            match result {
                Ok(()) => tracing::debug!("Sent {} clipboard to {}", fmt, ctx.peer),
                Err(e) => {
                    ctx.fail_clipboard(fmt, timestamp, Role::Src, handle.resolve(e))
                        .await;
                }
            }
        });
    }

    /// Read an announced clipboard payload and apply it locally.
    pub(super) fn spawn_clipboard_receive(&self, fmt: FmtType, timestamp: u64, header: ClipboardHeader) {
        let ctx = self.clone();
        tokio::spawn(async move {
            let handle = CancelHandle::child_of(&ctx.cancel, &ctx.peer);
            ctx.track_clipboard(fmt, timestamp, handle.clone()).await;

            let shared = &ctx.shared;
            let channel = Channel::Clipboard(fmt, timestamp);
            let result: Result<u64> = async {
                let mut stream = shared.registry.open(&ctx.peer, channel).await?;
                let data = tokio::select! {
                    () = handle.token().cancelled() => return Err(handle.cancellation_error()),
                    data = receive_clipboard(
                        &mut stream,
                        &header,
                        shared.config.clipboard.max_payload_bytes,
                        shared.config.clipboard.receive_timeout,
                    ) => data?,
                };
                let bundle = split_payload(&header, &data)?;
                shared
                    .clipboard
                    .apply_remote(&ctx.peer, ClipPayload::Bundle(bundle))?;
                Ok(data.len() as u64)
            }
            .await;

            shared.registry.close(&ctx.peer, channel).await;
            ctx.untrack_clipboard(fmt, timestamp).await;
            match result {
                Ok(bytes) => {
                    tracing::info!("Received {} clipboard from {} ({} bytes)", fmt, ctx.peer, bytes);
                    ctx.notify(UiEvent::ClipboardReceived {
                        peer: ctx.peer.clone(),
                        format: fmt,
                        bytes,
                    });
                }
                Err(e) => {
                    ctx.fail_clipboard(fmt, timestamp, Role::Dst, handle.resolve(e))
                        .await;
                }
            }
        });
    }

    async fn fail_clipboard(&self, fmt: FmtType, timestamp: u64, role: Role, err: Error) {
        let code = err.interrupt_code();
        if !matches!(err, Error::CancelledRemote | Error::SessionClosed(_)) {
            self.send_interrupt(
                fmt,
                role,
                InterruptPayload {
                    timestamp,
                    code,
                    last_file: String::new(),
                    offset: 0,
                    detail: err.to_string(),
                },
            )
            .await;
        }
        if matches!(err, Error::CancelledRemote) {
            return;
        }

        tracing::warn!("{} clipboard exchange with {} failed: {}", fmt, self.peer, err);
        self.notify(UiEvent::TransferFailed {
            peer: self.peer.clone(),
            timestamp,
            format: fmt,
            side: if role == Role::Src {
                Side::Source
            } else {
                Side::Destination
            },
            code,
            cancelled_locally: false,
            detail: err.to_string(),
        });
    }
}
