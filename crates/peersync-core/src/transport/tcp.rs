//! TCP stream transport.
//!
//! Each logical stream is its own TCP connection. The opener writes a
//! [`StreamHello`] frame first, so the listener knows which peer opened the
//! connection and for which protocol id.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use super::{BoxedStream, StreamHandler, StreamTransport};
use crate::error::{Error, Result};
use crate::protocol::{self, Frame, FrameKind, StreamHello};
use crate::roster::Roster;

/// Time allowed for the hello frame after a connection is accepted.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP keep-alive interval for idle stream connections.
const KEEPALIVE_TIME: Duration = Duration::from_secs(30);

/// Opens one TCP connection per logical stream, addressed through the roster.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    local_id: String,
    roster: Roster,
    connect_timeout: Duration,
}

impl TcpTransport {
    /// Create a transport that identifies itself as `local_id`.
    #[must_use]
    pub fn new(local_id: impl Into<String>, roster: Roster, connect_timeout: Duration) -> Self {
        Self {
            local_id: local_id.into(),
            roster,
            connect_timeout,
        }
    }
}

fn configure_socket(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

fn to_io(err: Error) -> io::Error {
    match err {
        Error::Io(e) => e,
        Error::Timeout(_) => io::Error::from(io::ErrorKind::TimedOut),
        Error::StreamReset => io::Error::from(io::ErrorKind::ConnectionReset),
        Error::UnexpectedEof => io::Error::from(io::ErrorKind::UnexpectedEof),
        other => io::Error::other(other.to_string()),
    }
}

#[async_trait]
impl StreamTransport for TcpTransport {
    async fn open_stream(&self, peer: &str, protocol_id: &str) -> io::Result<BoxedStream> {
        let info = self.roster.get(peer).await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("peer {peer} not in roster"))
        })?;

        let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(info.addr()))
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))??;
        configure_socket(&stream)?;

        let hello = StreamHello {
            peer_id: self.local_id.clone(),
            protocol: protocol_id.to_string(),
        };
        let frame = Frame::json(FrameKind::StreamHello, &hello).map_err(to_io)?;
        protocol::write_frame(&mut stream, &frame)
            .await
            .map_err(to_io)?;

        tracing::debug!("Opened TCP stream {} to {} ({})", protocol_id, peer, info.addr());
        Ok(Box::new(stream))
    }
}

async fn read_hello(stream: &mut TcpStream) -> Result<StreamHello> {
    protocol::timed(HELLO_TIMEOUT, protocol::read_frame(stream))
        .await?
        .parse(FrameKind::StreamHello)
}

/// Accept connections on `listener` and hand each stream to `handler`.
///
/// Runs until `cancel` fires.
///
/// # Errors
///
/// Returns an error if accepting fails for a reason other than a transient
/// per-connection failure.
pub async fn listen(
    listener: TcpListener,
    handler: Arc<dyn StreamHandler>,
    cancel: CancellationToken,
) -> Result<()> {
    tracing::info!("Stream listener on {}", listener.local_addr()?);

    loop {
        let (mut stream, addr) = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
                ) => {
                    tracing::debug!("Transient accept failure: {}", e);
                    continue;
                }
                Err(e) => return Err(Error::Io(e)),
            },
        };

        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            if let Err(e) = configure_socket(&stream) {
                tracing::debug!("Failed to configure socket from {}: {}", addr, e);
            }
            match read_hello(&mut stream).await {
                Ok(hello) => {
                    tracing::debug!(
                        "Accepted stream {} from {} ({})",
                        hello.protocol,
                        hello.peer_id,
                        addr
                    );
                    handler
                        .handle_stream(hello.peer_id, hello.protocol, Box::new(stream))
                        .await;
                }
                Err(e) => tracing::warn!("Dropping connection from {}: {}", addr, e),
            }
        });
    }
}
