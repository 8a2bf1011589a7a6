//! Cancellable stream wrappers.
//!
//! Both wrappers poll the cancellation token before touching the inner
//! stream. A pending read or write is woken by cancellation and fails with a
//! [`CopyCancelled`] error instead of blocking until the peer gives up.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Marker carried inside the `io::Error` of a cancelled copy.
#[derive(Debug, thiserror::Error)]
#[error("copy cancelled")]
pub struct CopyCancelled;

/// Whether an I/O error came from a cancelled wrapper.
#[must_use]
pub fn is_cancelled(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|inner| inner.is::<CopyCancelled>())
}

fn cancelled_error() -> io::Error {
    io::Error::other(CopyCancelled)
}

fn poll_cancelled(
    cancelled: &mut Pin<Box<WaitForCancellationFutureOwned>>,
    cx: &mut Context<'_>,
) -> bool {
    cancelled.as_mut().poll(cx).is_ready()
}

/// A reader that stops on cancellation.
pub struct CancellableReader<R> {
    inner: R,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<R> CancellableReader<R> {
    /// Wrap `inner`, observing `token`.
    pub fn new(inner: R, token: &CancellationToken) -> Self {
        Self {
            inner,
            cancelled: Box::pin(token.clone().cancelled_owned()),
        }
    }

    /// Unwrap the inner reader.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CancellableReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if poll_cancelled(&mut this.cancelled, cx) {
            return Poll::Ready(Err(cancelled_error()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

/// A writer that stops on cancellation.
pub struct CancellableWriter<W> {
    inner: W,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<W> CancellableWriter<W> {
    /// Wrap `inner`, observing `token`.
    pub fn new(inner: W, token: &CancellationToken) -> Self {
        Self {
            inner,
            cancelled: Box::pin(token.clone().cancelled_owned()),
        }
    }

    /// Unwrap the inner writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CancellableWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if poll_cancelled(&mut this.cancelled, cx) {
            return Poll::Ready(Err(cancelled_error()));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if poll_cancelled(&mut this.cancelled, cx) {
            return Poll::Ready(Err(cancelled_error()));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
