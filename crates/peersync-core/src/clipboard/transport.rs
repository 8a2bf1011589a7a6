//! Moving clipboard bundles over a clipboard stream.
//!
//! The payload is the concatenation of the text, image and html segments;
//! their lengths travel beforehand in the [`ClipboardHeader`] of the `INFO`
//! message, so the stream carries raw bytes only.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use super::{ClipBundle, ClipPayload, ClipboardSnapshot};
use crate::error::{Error, Result};
use crate::protocol::{ClipboardHeader, FmtType};

/// Build the header and wire payload of a snapshot for `fmt`.
///
/// `XCLIP_CB` carries text, image and html; `IMAGE_CB` carries the image
/// alone, for peers that do not understand the combined format.
///
/// # Errors
///
/// Returns `ClipboardSendFailed` if the snapshot holds plain text or `fmt`
/// is not a stream clipboard format.
pub fn build_payload(
    snapshot: &ClipboardSnapshot,
    fmt: FmtType,
) -> Result<(ClipboardHeader, Vec<u8>)> {
    let ClipPayload::Bundle(bundle) = &snapshot.payload else {
        return Err(Error::ClipboardSendFailed(format!(
            "snapshot holds {} content, not a clipboard bundle",
            snapshot.format()
        )));
    };

    let header = |text_len: usize, image_len: usize, html_len: usize| ClipboardHeader {
        text_len: text_len as u64,
        image_len: image_len as u64,
        html_len: html_len as u64,
        width: bundle.width,
        height: bundle.height,
    };

    match fmt {
        FmtType::XclipCb => {
            let mut data =
                Vec::with_capacity(bundle.text.len() + bundle.image.len() + bundle.html.len());
            data.extend_from_slice(&bundle.text);
            data.extend_from_slice(&bundle.image);
            data.extend_from_slice(&bundle.html);
            Ok((
                header(bundle.text.len(), bundle.image.len(), bundle.html.len()),
                data,
            ))
        }
        FmtType::ImageCb => Ok((header(0, bundle.image.len(), 0), bundle.image.clone())),
        other => Err(Error::ClipboardSendFailed(format!(
            "{other} is not sent over a clipboard stream"
        ))),
    }
}

/// Slice a received payload back into its segments.
///
/// # Errors
///
/// Returns `ClipboardReceiveIncomplete` if `data` is shorter than declared
/// and `Protocol` if the declared lengths overflow.
pub fn split_payload(header: &ClipboardHeader, data: &[u8]) -> Result<ClipBundle> {
    let expected = header.total_len()?;
    let short = || Error::ClipboardReceiveIncomplete {
        expected,
        received: data.len() as u64,
    };

    let mut rest = data;
    let mut segment = |len: u64| -> Result<Vec<u8>> {
        let len = usize::try_from(len).map_err(|_| short())?;
        let (head, tail) = rest.split_at_checked(len).ok_or_else(short)?;
        rest = tail;
        Ok(head.to_vec())
    };

    Ok(ClipBundle {
        text: segment(header.text_len)?,
        image: segment(header.image_len)?,
        html: segment(header.html_len)?,
        rtf: Vec::new(),
        width: header.width,
        height: header.height,
    })
}

/// Write a clipboard payload to the stream and flush it.
///
/// # Errors
///
/// Returns `ClipboardSendFailed` if the copy fails or times out.
pub async fn send_clipboard<W>(stream: &mut W, data: &[u8], io_timeout: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let write = async {
        stream.write_all(data).await?;
        stream.flush().await?;
        stream.shutdown().await
    };

    timeout(io_timeout, write)
        .await
        .map_err(|_| Error::ClipboardSendFailed(format!("timed out after {io_timeout:?}")))?
        .map_err(|e| Error::ClipboardSendFailed(e.to_string()))?;

    tracing::debug!("Sent clipboard payload ({} bytes)", data.len());
    Ok(())
}

/// Read exactly the payload announced by `header`.
///
/// # Errors
///
/// Returns `ClipboardReceiveTimeout` if the payload does not arrive within
/// `receive_timeout`, `ClipboardReceiveIncomplete` if the stream ends or
/// fails early, and `Protocol` if the declared size exceeds `max_bytes`.
pub async fn receive_clipboard<R>(
    stream: &mut R,
    header: &ClipboardHeader,
    max_bytes: u64,
    receive_timeout: Duration,
) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let expected = header.total_len()?;
    if expected > max_bytes {
        return Err(Error::Protocol(format!(
            "clipboard payload of {expected} bytes exceeds limit of {max_bytes}"
        )));
    }
    let capacity = usize::try_from(expected)
        .map_err(|_| Error::Protocol("clipboard payload too large".into()))?;

    let mut buf = vec![0u8; capacity];
    let mut received = 0usize;

    let read = async {
        while received < capacity {
            match stream.read(&mut buf[received..]).await {
                Ok(0) => break,
                Ok(n) => received += n,
                Err(e) => {
                    tracing::debug!("Clipboard stream failed after {} bytes: {}", received, e);
                    break;
                }
            }
        }
    };

    timeout(receive_timeout, read)
        .await
        .map_err(|_| Error::ClipboardReceiveTimeout(receive_timeout))?;

    if received < capacity {
        return Err(Error::ClipboardReceiveIncomplete {
            expected,
            received: received as u64,
        });
    }

    tracing::debug!("Received clipboard payload ({} bytes)", received);
    Ok(buf)
}
