//! Peer sessions and the engine service API.
//!
//! One [`SyncEngine`] owns the stream registry, the transfer queue, the
//! clipboard hub and one session per connected peer. A session is a set of
//! tasks sharing one cancellation token:
//!
//! - the session loop, the only consumer of state transitions
//! - a control-stream reader, which handles transfer-control commands inline
//! - a control-stream writer fed by an outbox
//! - a clipboard watcher and a file-drop watcher
//! - one task per running transfer, plus its progress ticker
//!
//! Every exchange (a clipboard format, or a single file drop) moves through
//! `INIT -> INFO -> TRANS -> IO` independently; see [`is_valid_transition`].

mod control;
mod drops;
mod engine;
mod peer;
mod state;
mod transfer;

pub use drops::{DropEvent, FileDropCenter};
pub use engine::{LocalIdentity, SyncEngine};
pub use state::{is_valid_transition, Exchange, ExchangeStates};
