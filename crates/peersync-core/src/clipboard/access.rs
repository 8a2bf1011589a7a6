//! Platform clipboard access and change polling.
//!
//! There is no universal change notification API, so local changes are
//! detected by polling the platform clipboard.

use std::sync::{Mutex, PoisonError};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{ClipPayload, ClipboardHub};
use crate::error::Result;

/// Default polling interval for clipboard changes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Platform-agnostic clipboard access.
pub trait ClipboardAccess: Send + Sync {
    /// Read current clipboard content.
    ///
    /// # Errors
    ///
    /// Returns an error if clipboard access fails.
    fn read(&self) -> Result<Option<ClipPayload>>;

    /// Write content to clipboard.
    ///
    /// # Errors
    ///
    /// Returns an error if clipboard access fails.
    fn write(&self, payload: &ClipPayload) -> Result<()>;
}

/// An in-process clipboard.
#[derive(Debug, Default)]
pub struct MemoryClipboard {
    content: Mutex<Option<ClipPayload>>,
}

impl MemoryClipboard {
    /// Create an empty clipboard.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the content, as a user copying something would.
    pub fn set(&self, payload: ClipPayload) {
        *self.content.lock().unwrap_or_else(PoisonError::into_inner) = Some(payload);
    }
}

impl ClipboardAccess for MemoryClipboard {
    fn read(&self) -> Result<Option<ClipPayload>> {
        Ok(self
            .content
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn write(&self, payload: &ClipPayload) -> Result<()> {
        self.set(payload.clone());
        Ok(())
    }
}

/// Polls a [`ClipboardAccess`] and publishes changes into a [`ClipboardHub`].
#[derive(Debug, Clone, Copy)]
pub struct ClipboardPoller {
    poll_interval: Duration,
}

impl Default for ClipboardPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl ClipboardPoller {
    /// Create a poller with the default interval.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Create a poller with a custom interval.
    #[must_use]
    pub const fn with_interval(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Start polling until `cancel` fires.
    pub fn start(
        self,
        clipboard: Arc<dyn ClipboardAccess>,
        hub: ClipboardHub,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        tracing::debug!("Clipboard poller stopping");
                        break;
                    }
                    () = tokio::time::sleep(self.poll_interval) => {
                        match clipboard.read() {
                            Ok(Some(payload)) => {
                                hub.publish_local(payload);
                            }
                            Ok(None) => {}
                            Err(e) => tracing::debug!("Clipboard read failed: {}", e),
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_poller_publishes_changes() {
        let clipboard = Arc::new(MemoryClipboard::new());
        let hub = ClipboardHub::new("laptop", clipboard.clone());
        let mut changes = hub.subscribe();
        let cancel = CancellationToken::new();

        let task = ClipboardPoller::with_interval(Duration::from_millis(5)).start(
            clipboard.clone(),
            hub.clone(),
            cancel.clone(),
        );

        clipboard.set(ClipPayload::Text("copied".into()));
        tokio::time::timeout(Duration::from_secs(2), changes.changed())
            .await
            .expect("change seen")
            .expect("hub alive");

        let snapshot = hub.current().expect("snapshot");
        assert_eq!(snapshot.payload, ClipPayload::Text("copied".into()));
        assert_eq!(snapshot.source_id, "laptop");

        cancel.cancel();
        task.await.expect("poller stopped");
    }

    #[tokio::test]
    async fn test_poller_ignores_applied_remote_content() {
        let clipboard = Arc::new(MemoryClipboard::new());
        let hub = ClipboardHub::new("laptop", clipboard.clone());
        hub.apply_remote("desk", ClipPayload::Text("pasted".into()))
            .expect("apply");
        let mut changes = hub.subscribe();
        let cancel = CancellationToken::new();

        let task = ClipboardPoller::with_interval(Duration::from_millis(5)).start(
            clipboard.clone(),
            hub.clone(),
            cancel.clone(),
        );

        let result = tokio::time::timeout(Duration::from_millis(100), changes.changed()).await;
        assert!(result.is_err(), "remote content was republished");
        assert_eq!(hub.current().map(|s| s.source_id.clone()), Some("desk".into()));

        cancel.cancel();
        task.await.expect("poller stopped");
    }
}
