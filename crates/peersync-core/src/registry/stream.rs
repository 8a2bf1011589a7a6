//! Logical stream channels.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::protocol::FmtType;
use crate::transport::BoxedStream;

const PROTOCOL_PREFIX: &str = "peersync";
const PROTOCOL_SUFFIX: &str = "1";

/// Which logical stream of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// The per-peer message stream
    Control,
    /// A single-use stream for one clipboard exchange, keyed by format and
    /// snapshot timestamp
    Clipboard(FmtType, u64),
    /// A single-use stream for one file-drop transfer
    FileDrop(u64),
}

impl Channel {
    /// Protocol id used to open this channel on the transport.
    #[must_use]
    pub fn protocol_id(&self) -> String {
        match self {
            Self::Control => format!("{PROTOCOL_PREFIX}/control/{PROTOCOL_SUFFIX}"),
            Self::Clipboard(fmt, ts) => {
                format!("{PROTOCOL_PREFIX}/clipboard/{fmt}/{ts}/{PROTOCOL_SUFFIX}")
            }
            Self::FileDrop(ts) => format!("{PROTOCOL_PREFIX}/file-drop/{ts}/{PROTOCOL_SUFFIX}"),
        }
    }

    /// Parse a protocol id back into a channel.
    #[must_use]
    pub fn from_protocol_id(id: &str) -> Option<Self> {
        let parts: Vec<&str> = id.split('/').collect();
        match parts.as_slice() {
            [PROTOCOL_PREFIX, "control", PROTOCOL_SUFFIX] => Some(Self::Control),
            [PROTOCOL_PREFIX, "clipboard", fmt, ts, PROTOCOL_SUFFIX] => {
                Some(Self::Clipboard(FmtType::from_wire(fmt)?, ts.parse().ok()?))
            }
            [PROTOCOL_PREFIX, "file-drop", ts, PROTOCOL_SUFFIX] => {
                ts.parse().ok().map(Self::FileDrop)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Control => f.write_str("control"),
            Self::Clipboard(fmt, ts) => write!(f, "clipboard {fmt}#{ts}"),
            Self::FileDrop(ts) => write!(f, "file-drop {ts}"),
        }
    }
}

/// A logical byte stream for one channel of one peer.
///
/// Owned by whichever side currently performs I/O on it.
pub struct FormatStream {
    peer: String,
    channel: Channel,
    inner: BoxedStream,
}

impl fmt::Debug for FormatStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormatStream")
            .field("peer", &self.peer)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl FormatStream {
    pub(crate) fn new(peer: impl Into<String>, channel: Channel, inner: BoxedStream) -> Self {
        Self {
            peer: peer.into(),
            channel,
            inner,
        }
    }

    /// Peer this stream belongs to.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Channel this stream carries.
    #[must_use]
    pub const fn channel(&self) -> Channel {
        self.channel
    }
}

impl AsyncRead for FormatStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for FormatStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
