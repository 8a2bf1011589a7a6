//! Cancellation handles for transfer tasks.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Who asked for a transfer to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOrigin {
    /// The local user
    LocalUi,
    /// The peer, through an interrupt or cancel message
    Remote,
}

const ORIGIN_NONE: u8 = 0;
const ORIGIN_LOCAL: u8 = 1;
const ORIGIN_REMOTE: u8 = 2;

/// Aborts one transfer task.
///
/// The token is a child of the session token, so ending the session stops
/// the transfer too. The first recorded origin wins.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
    origin: Arc<AtomicU8>,
    peer: String,
}

impl CancelHandle {
    /// A handle whose token is a child of `parent`.
    #[must_use]
    pub fn child_of(parent: &CancellationToken, peer: &str) -> Self {
        Self {
            token: parent.child_token(),
            origin: Arc::new(AtomicU8::new(ORIGIN_NONE)),
            peer: peer.to_string(),
        }
    }

    /// Cancel the transfer.
    pub fn cancel(&self, origin: CancelOrigin) {
        let value = match origin {
            CancelOrigin::LocalUi => ORIGIN_LOCAL,
            CancelOrigin::Remote => ORIGIN_REMOTE,
        };
        let _ = self
            .origin
            .compare_exchange(ORIGIN_NONE, value, Ordering::AcqRel, Ordering::Acquire);
        self.token.cancel();
    }

    /// The recorded origin, if [`cancel`](Self::cancel) was called.
    #[must_use]
    pub fn origin(&self) -> Option<CancelOrigin> {
        match self.origin.load(Ordering::Acquire) {
            ORIGIN_LOCAL => Some(CancelOrigin::LocalUi),
            ORIGIN_REMOTE => Some(CancelOrigin::Remote),
            _ => None,
        }
    }

    /// Whether the transfer was cancelled, directly or through the session.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The token copy loops select on.
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// The error a cancelled transfer ends with.
    #[must_use]
    pub fn cancellation_error(&self) -> Error {
        match self.origin() {
            Some(CancelOrigin::LocalUi) => Error::CancelledLocal,
            Some(CancelOrigin::Remote) => Error::CancelledRemote,
            None => Error::SessionClosed(self.peer.clone()),
        }
    }

    /// Replace an error raised after cancellation with the cancellation
    /// error. Errors of a transfer that was not cancelled pass through.
    #[must_use]
    pub fn resolve(&self, err: Error) -> Error {
        if self.is_cancelled() {
            self.cancellation_error()
        } else {
            err
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_origin_wins() {
        let handle = CancelHandle::child_of(&CancellationToken::new(), "desk");
        handle.cancel(CancelOrigin::Remote);
        handle.cancel(CancelOrigin::LocalUi);

        assert_eq!(handle.origin(), Some(CancelOrigin::Remote));
        assert!(matches!(
            handle.resolve(Error::StreamReset),
            Error::CancelledRemote
        ));
    }

    #[test]
    fn test_session_cancel_reaches_child() {
        let session = CancellationToken::new();
        let handle = CancelHandle::child_of(&session, "desk");

        assert!(matches!(
            handle.resolve(Error::StreamReset),
            Error::StreamReset
        ));

        session.cancel();
        assert!(handle.is_cancelled());
        assert!(matches!(
            handle.resolve(Error::UnexpectedEof),
            Error::SessionClosed(_)
        ));
    }

    #[test]
    fn test_local_cancel_is_distinct() {
        let handle = CancelHandle::child_of(&CancellationToken::new(), "desk");
        handle.cancel(CancelOrigin::LocalUi);
        assert!(matches!(handle.cancellation_error(), Error::CancelledLocal));
    }
}
