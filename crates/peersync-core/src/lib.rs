//! # PeerSync Core Library
//!
//! `peersync-core` keeps a shared clipboard synchronized between devices on a
//! peer-to-peer overlay and exchanges dropped files between them.
//!
//! ## Features
//!
//! - **Clipboard sync**: Text is replicated inline, images and rich bundles
//!   over a dedicated stream
//! - **File drop**: Files and whole folders, with accept/reject, progress,
//!   cancellation from either side and resume of interrupted transfers
//! - **Many peers**: One independent session per peer, all sharing a stream
//!   registry and a transfer queue
//!
//! ## Modules
//!
//! - [`clipboard`] - Clipboard snapshots, the clipboard hub and clipboard stream transport
//! - [`config`] - Configuration management
//! - [`error`] - Error taxonomy
//! - [`mod@file`] - Transfer descriptors, cancellable I/O and the file transfer engine
//! - [`protocol`] - Wire envelope and frame codec
//! - [`queue`] - Per-peer transfer queue with admission control
//! - [`registry`] - Per-peer logical stream registry
//! - [`roster`] - Known peers and connection role tie-break
//! - [`session`] - Peer session state machine and the [`SyncEngine`] service
//! - [`transport`] - Stream transport abstraction and implementations
//! - [`ui`] - UI capability interface
//!
//! ## Example
//!
//! ```rust,ignore
//! use peersync_core::{SyncEngine, session::LocalIdentity};
//!
//! let engine = SyncEngine::new(identity, config, transport, roster, clipboard, ui)?;
//! engine.start_process_for_peer("desk").await?;
//!
//! let transfer = engine.send_files("desk", &["report.pdf".into()]).await?;
//! engine.cancel_transfer("desk", transfer).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::unused_async)]
#![allow(clippy::len_without_is_empty)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

pub mod clipboard;
pub mod config;
pub mod error;
pub mod file;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod roster;
pub mod session;
pub mod transport;
pub mod ui;

pub use error::{Error, Result};
pub use session::SyncEngine;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version for the wire envelope framing
pub const PROTOCOL_VERSION: (u8, u8) = (1, 0);

/// Default TCP listen port for the stream transport
pub const DEFAULT_LISTEN_PORT: u16 = 52600;

/// Default chunk size for file copies (64 KB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default number of transfers per direction that may run at once for a peer
pub const DEFAULT_MAX_CONCURRENT_TRANSFERS: usize = 1;

/// Default number of transfers that may be queued for a peer
pub const DEFAULT_MAX_QUEUED_TRANSFERS: usize = 32;

/// Polling interval of the file-drop watcher in milliseconds
pub const DEFAULT_FILE_DROP_POLL_MS: u64 = 100;

/// Default interval between progress reports in milliseconds
pub const DEFAULT_PROGRESS_TICK_MS: u64 = 500;

/// Current time as milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}
