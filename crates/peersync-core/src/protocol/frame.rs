//! Length-prefixed frame codec.
//!
//! ```text
//! ┌──────────┬─────────┬──────┬────────────┬──────────────────────┐
//! │  "PSYN"  │ version │ kind │ length, BE │ JSON body            │
//! │ 4 bytes  │ 2 bytes │  1   │  4 bytes   │ up to 16 MiB         │
//! └──────────┴─────────┴──────┴────────────┴──────────────────────┘
//! ```
//!
//! Only the major version has to match. A frame whose declared length exceeds
//! [`MAX_FRAME_BODY`] is refused before its body is read.

use std::future::Future;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Leading bytes of every frame.
pub const MAGIC: [u8; 4] = *b"PSYN";

/// Bytes before the body.
pub const HEADER_LEN: usize = 11;

/// Largest accepted body.
pub const MAX_FRAME_BODY: usize = 16 * 1024 * 1024;

/// What a frame body holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// A session message envelope
    Envelope = 1,
    /// First frame on a raw transport connection, naming the logical stream
    StreamHello = 2,
}

impl TryFrom<u8> for FrameKind {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(Self::Envelope),
            2 => Ok(Self::StreamHello),
            other => Err(Error::Protocol(format!("unknown frame kind {other:#04x}"))),
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// What the body holds
    pub kind: FrameKind,
    /// JSON body
    pub body: Vec<u8>,
}

impl Frame {
    /// Frame with an already-encoded body.
    #[must_use]
    pub const fn new(kind: FrameKind, body: Vec<u8>) -> Self {
        Self { kind, body }
    }

    /// Build a frame whose body is `value` as JSON.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if `value` cannot be serialized.
    pub fn json<T: Serialize>(kind: FrameKind, value: &T) -> Result<Self> {
        Ok(Self::new(kind, to_json(value)?))
    }

    /// Parse the body as JSON, insisting on the frame kind.
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` on a kind mismatch and `Error::Serialization`
    /// if the body does not parse.
    pub fn parse<T: DeserializeOwned>(&self, expected: FrameKind) -> Result<T> {
        if self.kind != expected {
            return Err(Error::Protocol(format!(
                "expected {expected:?} frame, got {:?}",
                self.kind
            )));
        }
        from_json(&self.body)
    }
}

/// First frame sent on every raw transport connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamHello {
    /// Identity of the peer opening the stream
    pub peer_id: String,
    /// Protocol id of the logical stream
    pub protocol: String,
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))
}

pub(crate) fn from_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
}

fn encode_header(kind: FrameKind, body_len: u32) -> [u8; HEADER_LEN] {
    let (major, minor) = crate::PROTOCOL_VERSION;
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&MAGIC);
    header[4] = major;
    header[5] = minor;
    header[6] = kind as u8;
    header[7..].copy_from_slice(&body_len.to_be_bytes());
    header
}

fn decode_header(header: &[u8; HEADER_LEN]) -> Result<(FrameKind, usize)> {
    if header[..4] != MAGIC {
        return Err(Error::Protocol("not a PeerSync frame".to_string()));
    }
    if header[4] != crate::PROTOCOL_VERSION.0 {
        return Err(Error::Protocol(format!(
            "peer speaks protocol {}.{}",
            header[4], header[5]
        )));
    }
    let kind = FrameKind::try_from(header[6])?;
    let len = u32::from_be_bytes([header[7], header[8], header[9], header[10]]) as usize;
    if len > MAX_FRAME_BODY {
        return Err(Error::Protocol(format!("frame of {len} bytes exceeds the limit")));
    }
    Ok((kind, len))
}

/// Read one frame.
///
/// # Errors
///
/// Returns a transport-class error if the stream fails or ends early, and
/// `Error::Protocol` if the header is invalid.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut header)
        .await
        .map_err(Error::from_stream)?;
    let (kind, len) = decode_header(&header)?;

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(Error::from_stream)?;
    Ok(Frame::new(kind, body))
}

/// Write one frame and flush.
///
/// # Errors
///
/// Returns `Error::Protocol` if the body is too large, or a transport-class
/// error if the stream fails.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(frame.body.len())
        .ok()
        .filter(|&len| len as usize <= MAX_FRAME_BODY)
        .ok_or_else(|| {
            Error::Protocol(format!("frame of {} bytes exceeds the limit", frame.body.len()))
        })?;

    let mut buf = Vec::with_capacity(HEADER_LEN + frame.body.len());
    buf.extend_from_slice(&encode_header(frame.kind, len));
    buf.extend_from_slice(&frame.body);
    writer.write_all(&buf).await.map_err(Error::from_stream)?;
    writer.flush().await.map_err(Error::from_stream)
}

/// Run a frame operation under `duration`.
///
/// # Errors
///
/// Returns `Error::Timeout` when `duration` elapses first, otherwise whatever
/// `op` returns.
pub async fn timed<T, F>(duration: Duration, op: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(duration, op)
        .await
        .map_err(|_| Error::Timeout(duration))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_survives_the_wire() {
        let frame = Frame::new(FrameKind::Envelope, b"{\"hello\":1}".to_vec());
        let mut wire = Vec::new();
        write_frame(&mut wire, &frame).await.expect("write");

        assert_eq!(&wire[..4], b"PSYN");
        assert_eq!(wire.len(), HEADER_LEN + frame.body.len());

        let read = read_frame(&mut wire.as_slice()).await.expect("read");
        assert_eq!(read, frame);
    }

    #[tokio::test]
    async fn test_foreign_bytes_are_refused() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &Frame::new(FrameKind::Envelope, Vec::new()))
            .await
            .expect("write");
        wire[0] = b'X';

        let result = read_frame(&mut wire.as_slice()).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn test_oversized_length_is_refused_from_the_header() {
        #[allow(clippy::cast_possible_truncation)]
        let header = encode_header(FrameKind::Envelope, (MAX_FRAME_BODY + 1) as u32);
        assert!(decode_header(&header).is_err());

        let mut newer = encode_header(FrameKind::Envelope, 0);
        newer[4] += 1;
        assert!(decode_header(&newer).is_err());

        let mut unknown = encode_header(FrameKind::Envelope, 0);
        unknown[6] = 0x7f;
        assert!(decode_header(&unknown).is_err());
    }

    #[tokio::test]
    async fn test_truncated_body_is_eof() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &Frame::new(FrameKind::Envelope, b"0123456789".to_vec()))
            .await
            .expect("write");
        wire.truncate(HEADER_LEN + 4);

        let result = read_frame(&mut wire.as_slice()).await;
        assert!(matches!(result, Err(Error::UnexpectedEof)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_read_gives_up() {
        let (mut idle, _keep_open) = tokio::io::duplex(64);
        let result = timed(Duration::from_secs(3), read_frame(&mut idle)).await;

        assert!(matches!(result, Err(Error::Timeout(d)) if d == Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn test_hello_parses_only_as_hello() {
        let hello = StreamHello {
            peer_id: "laptop".to_string(),
            protocol: "peersync/control/1".to_string(),
        };
        let frame = Frame::json(FrameKind::StreamHello, &hello).expect("encode");

        let mut wire = Vec::new();
        write_frame(&mut wire, &frame).await.expect("write");
        let read = read_frame(&mut wire.as_slice()).await.expect("read");

        let parsed: StreamHello = read.parse(FrameKind::StreamHello).expect("parse");
        assert_eq!(parsed.peer_id, "laptop");
        assert_eq!(parsed.protocol, "peersync/control/1");
        assert!(read.parse::<StreamHello>(FrameKind::Envelope).is_err());
    }
}
