//! Per-peer logical stream registry.
//!
//! The registry is the single owner of every logical stream that is not
//! currently performing I/O. Streams are keyed by `(peer, Channel)`:
//!
//! - [`StreamRegistry::open`] asks the transport for a new stream and hands
//!   it straight to the caller.
//! - Streams opened by remote peers arrive through [`StreamHandler`] and wait
//!   in the registry until [`StreamRegistry::ensure_ready`] takes them. Apart
//!   from the control stream, a stream is only accepted after
//!   [`StreamRegistry::listen`] announced it.
//! - [`StreamRegistry::close`] forgets a stream; it is idempotent.
//!
//! Streams are single-use. A new transfer of the same format always opens a
//! new stream. The map lock is only held for lookups and inserts, never
//! across transport I/O.

mod stream;

pub use stream::{Channel, FormatStream};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::transport::{BoxedStream, StreamHandler, StreamTransport};

type Key = (String, Channel);

enum Slot {
    /// A listener is waiting for the peer to open the stream
    Listening,
    /// An inbound stream waiting to be taken
    Ready(FormatStream),
    /// The stream is owned by a transfer
    InUse,
}

#[derive(Default)]
struct Inner {
    peers: HashSet<String>,
    slots: HashMap<Key, Slot>,
}

/// Shared registry of logical streams for all peers.
#[derive(Clone)]
pub struct StreamRegistry {
    inner: Arc<RwLock<Inner>>,
    changed: Arc<Notify>,
    transport: Arc<dyn StreamTransport>,
    open_timeout: Duration,
}

impl std::fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("open_timeout", &self.open_timeout)
            .finish_non_exhaustive()
    }
}

impl StreamRegistry {
    /// Create a registry that opens streams through `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn StreamTransport>, open_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            changed: Arc::new(Notify::new()),
            transport,
            open_timeout,
        }
    }

    /// Start tracking a peer. Waiters for its streams are served from now on.
    pub async fn add_peer(&self, peer: &str) {
        self.inner.write().await.peers.insert(peer.to_string());
        self.changed.notify_waiters();
    }

    /// Stop tracking a peer, dropping every stream still held for it.
    ///
    /// Pending [`ensure_ready`](Self::ensure_ready) calls fail with
    /// `StreamUnavailable`.
    pub async fn remove_peer(&self, peer: &str) {
        {
            let mut inner = self.inner.write().await;
            inner.peers.remove(peer);
            inner.slots.retain(|(p, _), _| p != peer);
        }
        self.changed.notify_waiters();
        tracing::debug!("Released all streams of {}", peer);
    }

    /// Whether the peer is currently tracked.
    pub async fn has_peer(&self, peer: &str) -> bool {
        self.inner.read().await.peers.contains(peer)
    }

    /// Expect the peer to open `channel`. Required before any stream other
    /// than the control stream is accepted from that peer.
    pub async fn listen(&self, peer: &str, channel: Channel) {
        let mut inner = self.inner.write().await;
        inner
            .slots
            .entry((peer.to_string(), channel))
            .or_insert(Slot::Listening);
        tracing::debug!("Listening for {} stream from {}", channel, peer);
    }

    /// Open a new stream to `peer` through the transport.
    ///
    /// # Errors
    ///
    /// Returns `StreamOpenFailed` if the transport fails or times out.
    pub async fn open(&self, peer: &str, channel: Channel) -> Result<FormatStream> {
        let open_failed = |reason: String| Error::StreamOpenFailed {
            peer: peer.to_string(),
            channel: channel.to_string(),
            reason,
        };

        let stream = tokio::time::timeout(
            self.open_timeout,
            self.transport.open_stream(peer, &channel.protocol_id()),
        )
        .await
        .map_err(|_| open_failed(format!("timed out after {:?}", self.open_timeout)))?
        .map_err(|e| open_failed(Error::from_stream(e).to_string()))?;

        self.inner
            .write()
            .await
            .slots
            .insert((peer.to_string(), channel), Slot::InUse);
        tracing::debug!("Opened {} stream to {}", channel, peer);

        Ok(FormatStream::new(peer, channel, stream))
    }

    /// Wait until a stream for `(peer, channel)` is ready and take it.
    ///
    /// # Errors
    ///
    /// Returns `StreamUnavailable` if the peer is gone, `Timeout` if nothing
    /// arrives within `wait`, and `SessionClosed` if `cancel` fires first.
    pub async fn ensure_ready(
        &self,
        peer: &str,
        channel: Channel,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<FormatStream> {
        let deadline = Instant::now() + wait;
        let key = (peer.to_string(), channel);

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.write().await;
                if !inner.peers.contains(peer) {
                    return Err(Error::StreamUnavailable {
                        peer: peer.to_string(),
                        channel: channel.to_string(),
                    });
                }
                if matches!(inner.slots.get(&key), Some(Slot::Ready(_))) {
                    if let Some(Slot::Ready(stream)) =
                        inner.slots.insert(key.clone(), Slot::InUse)
                    {
                        tracing::debug!("{} stream from {} is ready", channel, peer);
                        return Ok(stream);
                    }
                    return Err(Error::Internal("ready slot vanished".to_string()));
                }
            }

            tokio::select! {
                () = &mut notified => {}
                () = cancel.cancelled() => return Err(Error::SessionClosed(peer.to_string())),
                () = tokio::time::sleep_until(deadline) => {
                    return Err(Error::Timeout(wait));
                }
            }
        }
    }

    /// Release and forget the stream for `(peer, channel)`. Idempotent.
    pub async fn close(&self, peer: &str, channel: Channel) {
        let removed = self
            .inner
            .write()
            .await
            .slots
            .remove(&(peer.to_string(), channel));
        if removed.is_some() {
            tracing::debug!("Closed {} stream of {}", channel, peer);
            self.changed.notify_waiters();
        }
    }

    /// Whether anything is registered for `(peer, channel)`.
    pub async fn is_registered(&self, peer: &str, channel: Channel) -> bool {
        self.inner
            .read()
            .await
            .slots
            .contains_key(&(peer.to_string(), channel))
    }

    /// Route a stream opened by a remote peer.
    ///
    /// The control stream is always accepted. Any other stream is accepted
    /// only while [`listen`](Self::listen) waits for it, so a stream cannot
    /// outlive or precede the transfer it belongs to.
    pub async fn accept_incoming(&self, peer: &str, protocol: &str, stream: BoxedStream) {
        let Some(channel) = Channel::from_protocol_id(protocol) else {
            tracing::warn!("Rejected stream with unknown protocol {} from {}", protocol, peer);
            return;
        };

        {
            let mut inner = self.inner.write().await;
            let key = (peer.to_string(), channel);
            if channel != Channel::Control
                && !matches!(inner.slots.get(&key), Some(Slot::Listening))
            {
                tracing::warn!("Rejected unexpected {} stream from {}", channel, peer);
                return;
            }
            inner
                .slots
                .insert(key, Slot::Ready(FormatStream::new(peer, channel, stream)));
        }

        tracing::debug!("Accepted {} stream from {}", channel, peer);
        self.changed.notify_waiters();
    }
}

#[async_trait]
impl StreamHandler for StreamRegistry {
    async fn handle_stream(&self, peer: String, protocol: String, stream: BoxedStream) {
        self.accept_incoming(&peer, &protocol, stream).await;
    }
}
