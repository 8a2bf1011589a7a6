//! Transfer progress aggregation.
//!
//! Copy loops update a [`ProgressReporter`] on every chunk; a separate ticker
//! task forwards the latest snapshot to the UI on a fixed interval, so the UI
//! update rate does not depend on throughput.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::FileDropData;
use crate::queue::Direction;
use crate::ui::{UiEvent, UiSink};

/// Progress of one file-drop transfer.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// Peer on the other end
    pub peer: String,
    /// Transfer identity
    pub timestamp: u64,
    /// Our side of the transfer
    pub direction: Direction,
    /// Index of the file being copied
    pub current_file: usize,
    /// Number of files
    pub total_files: usize,
    /// Name of the file being copied
    pub current_file_name: String,
    /// Bytes of the current file copied
    pub file_bytes_transferred: u64,
    /// Bytes copied across all files
    pub bytes_transferred: u64,
    /// Total bytes across all files
    pub total_bytes: u64,
    /// Transfer speed in bytes per second
    pub speed_bps: u64,
    /// When the copy started
    pub started_at: Instant,
}

impl TransferProgress {
    /// Fresh progress for a descriptor.
    #[must_use]
    pub fn new(peer: &str, descriptor: &FileDropData, direction: Direction) -> Self {
        Self {
            peer: peer.to_string(),
            timestamp: descriptor.timestamp,
            direction,
            current_file: 0,
            total_files: descriptor.files.len(),
            current_file_name: String::new(),
            file_bytes_transferred: 0,
            bytes_transferred: 0,
            total_bytes: descriptor.total_size,
            speed_bps: 0,
            started_at: Instant::now(),
        }
    }

    /// Get overall progress as a percentage (0.0 - 100.0).
    #[must_use]
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            100.0
        } else {
            (self.bytes_transferred as f64 / self.total_bytes as f64) * 100.0
        }
    }
}

/// Shared progress of one running transfer.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: Arc<watch::Sender<TransferProgress>>,
}

impl ProgressReporter {
    /// Start tracking a transfer.
    #[must_use]
    pub fn new(peer: &str, descriptor: &FileDropData, direction: Direction) -> Self {
        let (tx, _rx) = watch::channel(TransferProgress::new(peer, descriptor, direction));
        Self { tx: Arc::new(tx) }
    }

    /// Move to the next file.
    pub fn start_file(&self, index: usize, name: &str) {
        self.tx.send_modify(|p| {
            p.current_file = index;
            p.current_file_name = name.to_string();
            p.file_bytes_transferred = 0;
        });
    }

    /// Account for copied bytes.
    pub fn add_bytes(&self, n: u64) {
        self.tx.send_modify(|p| {
            p.file_bytes_transferred += n;
            p.bytes_transferred += n;
            let elapsed = p.started_at.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                {
                    p.speed_bps = (p.bytes_transferred as f64 / elapsed) as u64;
                }
            }
        });
    }

    /// Latest progress.
    #[must_use]
    pub fn snapshot(&self) -> TransferProgress {
        self.tx.borrow().clone()
    }

    /// Observe progress changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<TransferProgress> {
        self.tx.subscribe()
    }
}

/// Forward progress to the UI every `tick` until `stop` fires.
pub fn spawn_progress_ticker(
    reporter: &ProgressReporter,
    ui: Arc<dyn UiSink>,
    tick: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    let mut rx = reporter.subscribe();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                _ = interval.tick() => {
                    if rx.has_changed().unwrap_or(false) {
                        let progress = rx.borrow_and_update().clone();
                        ui.notify(UiEvent::Progress(progress));
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileInfo;
    use crate::ui::ChannelUi;

    fn descriptor() -> FileDropData {
        FileDropData::new(
            42,
            vec![FileInfo::new("/a", "a", 600), FileInfo::new("/b", "b", 400)],
        )
    }

    #[test]
    fn test_progress_accumulates() {
        let reporter = ProgressReporter::new("desk", &descriptor(), Direction::AsSrc);
        reporter.start_file(0, "a");
        reporter.add_bytes(600);
        reporter.start_file(1, "b");
        reporter.add_bytes(100);

        let progress = reporter.snapshot();
        assert_eq!(progress.current_file, 1);
        assert_eq!(progress.current_file_name, "b");
        assert_eq!(progress.file_bytes_transferred, 100);
        assert_eq!(progress.bytes_transferred, 700);
        assert!((progress.percentage() - 70.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_ticker_reports_changes_only() {
        let (ui, mut events) = ChannelUi::new();
        let reporter = ProgressReporter::new("desk", &descriptor(), Direction::AsDst);
        let stop = CancellationToken::new();

        let ticker = spawn_progress_ticker(
            &reporter,
            Arc::new(ui),
            Duration::from_millis(10),
            stop.clone(),
        );
        reporter.add_bytes(10);

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("tick")
            .expect("event");
        match event {
            UiEvent::Progress(p) => assert_eq!(p.bytes_transferred, 10),
            other => panic!("expected progress, got {other:?}"),
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());

        stop.cancel();
        ticker.await.expect("ticker stopped");
    }
}
