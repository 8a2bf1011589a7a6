//! In-process stream transport.
//!
//! Every attached endpoint registers a [`StreamHandler`]. Opening a stream
//! creates a `tokio::io::duplex` pair, hands one half to the remote handler
//! on a fresh task and returns the other half to the caller.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{BoxedStream, StreamHandler, StreamTransport};

/// Buffer size of each in-memory pipe.
const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Default)]
struct NetworkInner {
    handlers: HashMap<String, Arc<dyn StreamHandler>>,
    blocked: Vec<String>,
}

/// A shared in-process network of endpoints.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<RwLock<NetworkInner>>,
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork").finish_non_exhaustive()
    }
}

impl MemoryNetwork {
    /// Create an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler that receives streams opened to `id`.
    pub async fn attach(&self, id: impl Into<String>, handler: Arc<dyn StreamHandler>) {
        self.inner.write().await.handlers.insert(id.into(), handler);
    }

    /// Remove an endpoint. Later opens to it fail with `ConnectionRefused`.
    pub async fn detach(&self, id: &str) {
        self.inner.write().await.handlers.remove(id);
    }

    /// Refuse every stream whose protocol id starts with `prefix`.
    pub async fn block_protocol(&self, prefix: impl Into<String>) {
        self.inner.write().await.blocked.push(prefix.into());
    }

    /// Lift every protocol block.
    pub async fn unblock_all(&self) {
        self.inner.write().await.blocked.clear();
    }

    /// A transport that opens streams on behalf of `local_id`.
    #[must_use]
    pub fn endpoint(&self, local_id: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            local_id: local_id.into(),
        }
    }
}

/// One endpoint's view of a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local_id: String,
}

#[async_trait]
impl StreamTransport for MemoryTransport {
    async fn open_stream(&self, peer: &str, protocol: &str) -> io::Result<BoxedStream> {
        let handler = {
            let inner = self.network.inner.read().await;
            if inner.blocked.iter().any(|p| protocol.starts_with(p.as_str())) {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("protocol {protocol} blocked"),
                ));
            }
            inner.handlers.get(peer).cloned().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("no endpoint named {peer}"),
                )
            })?
        };

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let from = self.local_id.clone();
        let protocol = protocol.to_string();
        tokio::spawn(async move {
            handler.handle_stream(from, protocol, Box::new(remote)).await;
        });

        Ok(Box::new(local))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    struct Echo {
        seen: mpsc::UnboundedSender<(String, String)>,
    }

    #[async_trait]
    impl StreamHandler for Echo {
        async fn handle_stream(&self, peer: String, protocol: String, mut stream: BoxedStream) {
            let _ = self.seen.send((peer, protocol));
            let mut buf = [0u8; 5];
            if stream.read_exact(&mut buf).await.is_ok() {
                let _ = stream.write_all(&buf).await;
            }
        }
    }

    #[tokio::test]
    async fn test_open_reaches_remote_handler() {
        let network = MemoryNetwork::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        network.attach("desk", Arc::new(Echo { seen: tx })).await;

        let transport = network.endpoint("laptop");
        let mut stream = transport
            .open_stream("desk", "peersync/control/1")
            .await
            .expect("open");

        stream.write_all(b"hello").await.expect("write");
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.expect("read");

        assert_eq!(&buf, b"hello");
        let (peer, protocol) = rx.recv().await.expect("handler called");
        assert_eq!(peer, "laptop");
        assert_eq!(protocol, "peersync/control/1");
    }

    #[tokio::test]
    async fn test_unknown_or_blocked_peer_is_refused() {
        let network = MemoryNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        network.attach("desk", Arc::new(Echo { seen: tx })).await;
        network.block_protocol("peersync/file-drop/").await;

        let transport = network.endpoint("laptop");

        let missing = transport.open_stream("phone", "peersync/control/1").await;
        assert_eq!(
            missing.err().map(|e| e.kind()),
            Some(io::ErrorKind::ConnectionRefused)
        );

        let blocked = transport.open_stream("desk", "peersync/file-drop/42/1").await;
        assert!(blocked.is_err());

        network.unblock_all().await;
        assert!(transport
            .open_stream("desk", "peersync/file-drop/42/1")
            .await
            .is_ok());
    }
}
