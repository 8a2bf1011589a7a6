//! Stream transport abstraction.
//!
//! The engine never talks to sockets directly. It asks a [`StreamTransport`]
//! for a reliable, ordered byte stream to a peer, addressed by a protocol id
//! string, and receives inbound streams through a [`StreamHandler`].
//!
//! Two implementations ship with the crate:
//!
//! - [`memory::MemoryNetwork`] - in-process streams over `tokio::io::duplex`
//! - [`tcp::TcpTransport`] - one TCP connection per logical stream

pub mod memory;
pub mod tcp;

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::TcpTransport;

/// A bidirectional byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

/// A type-erased stream handed out by a transport.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens logical streams to peers.
///
/// Errors are plain `io::Error`s so that timeouts, resets and EOF keep their
/// `io::ErrorKind`; the engine translates them at the registry boundary.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Open a new stream to `peer` for the given protocol id.
    async fn open_stream(&self, peer: &str, protocol: &str) -> io::Result<BoxedStream>;
}

/// Receives streams opened by remote peers.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    /// Take ownership of an inbound stream.
    async fn handle_stream(&self, peer: String, protocol: String, stream: BoxedStream);
}
