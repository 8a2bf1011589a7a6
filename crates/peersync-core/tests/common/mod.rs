//! Common test utilities for `PeerSync` integration tests.
//!
//! Every scenario runs two engines, "alpha" and "zulu", on one in-process
//! network. "zulu" has the greater identity, so it dials the control stream.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use peersync_core::clipboard::MemoryClipboard;
use peersync_core::config::Config;
use peersync_core::protocol::{
    read_frame, write_frame, Command, ExtData, FmtType, Frame, FrameKind, Message, State,
};
use peersync_core::roster::{ClientInfo, Roster};
use peersync_core::session::LocalIdentity;
use peersync_core::transport::{BoxedStream, MemoryNetwork, StreamHandler, StreamTransport};
use peersync_core::ui::{ChannelUi, UiEvent};
use peersync_core::SyncEngine;

/// How long a scenario waits for any single event.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// One device under test.
pub struct Node {
    pub id: String,
    pub engine: SyncEngine,
    pub events: UnboundedReceiver<UiEvent>,
    pub clipboard: Arc<MemoryClipboard>,
    pub downloads: TempDir,
}

impl Node {
    /// Wait for the first event matching `pred`, skipping the others.
    pub async fn wait_for<F>(&mut self, what: &str, mut pred: F) -> UiEvent
    where
        F: FnMut(&UiEvent) -> bool,
    {
        let id = self.id.clone();
        tokio::time::timeout(EVENT_TIMEOUT, async {
            loop {
                match self.events.recv().await {
                    Some(event) if pred(&event) => return event,
                    Some(_) => {}
                    None => panic!("{id}: event channel closed while waiting for {what}"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{id}: timed out waiting for {what}"))
    }

    /// Files currently in the download folder.
    pub fn downloaded_files(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(self.downloads.path()) else {
            return Vec::new();
        };
        let mut files: Vec<_> = entries
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        files.sort();
        files
    }
}

/// Two connected devices and the network between them.
pub struct Pair {
    pub network: MemoryNetwork,
    pub alpha: Node,
    pub zulu: Node,
}

/// Default test configuration with a private download folder.
pub fn test_config(downloads: &Path) -> Config {
    let mut config = Config::default();
    config.general.download_dir = Some(downloads.to_path_buf());
    config.session.stream_ready_timeout = Duration::from_secs(5);
    config.session.file_drop_poll_interval = Duration::from_millis(10);
    config.transfer.progress_tick = Duration::from_millis(20);
    config
}

async fn node(
    network: &MemoryNetwork,
    roster: Roster,
    id: &str,
    tweak: &impl Fn(&mut Config),
) -> Node {
    let downloads = tempfile::tempdir().expect("Failed to create temp directory");
    let mut config = test_config(downloads.path());
    tweak(&mut config);

    let (ui, events) = ChannelUi::new();
    let clipboard = Arc::new(MemoryClipboard::new());
    let engine = SyncEngine::new(
        LocalIdentity::from_config(id, &config),
        config,
        Arc::new(network.endpoint(id)),
        roster,
        clipboard.clone(),
        Arc::new(ui),
    )
    .expect("Failed to create engine");
    network.attach(id, engine.stream_handler()).await;

    Node {
        id: id.to_string(),
        engine,
        events,
        clipboard,
        downloads,
    }
}

fn client(id: &str, port: u16) -> ClientInfo {
    ClientInfo {
        id: id.to_string(),
        ip: "127.0.0.1".parse().expect("valid address"),
        port,
        platform: "linux".to_string(),
        device_name: id.to_string(),
        supports_extended_clipboard: true,
    }
}

/// Connect two engines with default settings.
pub async fn connected_pair() -> Pair {
    connected_pair_with(|_| {}).await
}

/// Connect two engines, adjusting both configurations first.
pub async fn connected_pair_with(tweak: impl Fn(&mut Config)) -> Pair {
    let network = MemoryNetwork::new();

    let alpha_roster = Roster::new();
    alpha_roster.upsert(client("zulu", 52702)).await;
    let zulu_roster = Roster::new();
    zulu_roster.upsert(client("alpha", 52701)).await;

    let mut alpha = node(&network, alpha_roster, "alpha", &tweak).await;
    let mut zulu = node(&network, zulu_roster, "zulu", &tweak).await;

    let (a, z) = tokio::join!(
        alpha.engine.start_process_for_peer("zulu"),
        zulu.engine.start_process_for_peer("alpha"),
    );
    a.expect("alpha failed to start session");
    z.expect("zulu failed to start session");

    alpha
        .wait_for("PeerConnected", |e| matches!(e, UiEvent::PeerConnected { .. }))
        .await;
    zulu.wait_for("PeerConnected", |e| matches!(e, UiEvent::PeerConnected { .. }))
        .await;

    Pair {
        network,
        alpha,
        zulu,
    }
}

/// Streams "alpha" opens to a scripted peer.
struct Inbox(UnboundedSender<(String, BoxedStream)>);

#[async_trait]
impl StreamHandler for Inbox {
    async fn handle_stream(&self, _peer: String, protocol: String, stream: BoxedStream) {
        let _ = self.0.send((protocol, stream));
    }
}

/// A real "alpha" engine whose peer "zulu" is driven frame by frame.
pub struct Scripted {
    pub network: MemoryNetwork,
    pub alpha: Node,
    control: BoxedStream,
    inbox: UnboundedReceiver<(String, BoxedStream)>,
}

impl Scripted {
    /// Send a message to "alpha" as "zulu".
    pub async fn send(
        &mut self,
        fmt: FmtType,
        state: State,
        command: Command,
        timestamp: u64,
        ext: ExtData,
    ) {
        let message = Message {
            source_id: "zulu".to_string(),
            source_platform: "linux".to_string(),
            fmt,
            state,
            command,
            timestamp,
            ext,
        };
        let body = message.encode().expect("encode");
        write_frame(&mut self.control, &Frame::new(FrameKind::Envelope, body))
            .await
            .expect("write frame");
    }

    /// Wait for the first message from "alpha" matching `pred`.
    pub async fn expect<F>(&mut self, what: &str, mut pred: F) -> Message
    where
        F: FnMut(&Message) -> bool,
    {
        tokio::time::timeout(EVENT_TIMEOUT, async {
            loop {
                let frame = read_frame(&mut self.control).await.expect("read frame");
                let message = Message::decode(&frame.body).expect("decode");
                if pred(&message) {
                    return message;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("zulu: timed out waiting for {what}"))
    }

    /// Wait for "alpha" to open a stream to "zulu".
    pub async fn accept_stream(&mut self) -> (String, BoxedStream) {
        tokio::time::timeout(EVENT_TIMEOUT, self.inbox.recv())
            .await
            .expect("timed out waiting for a stream")
            .expect("inbox closed")
    }
}

/// Start "alpha" against a scripted "zulu".
pub async fn scripted_pair() -> Scripted {
    let network = MemoryNetwork::new();
    let roster = Roster::new();
    roster.upsert(client("zulu", 52702)).await;

    let mut alpha = node(&network, roster, "alpha", &|_| {}).await;
    let (tx, inbox) = mpsc::unbounded_channel();
    network.attach("zulu", Arc::new(Inbox(tx))).await;

    let dial = network.endpoint("zulu");
    let (started, control) = tokio::join!(
        alpha.engine.start_process_for_peer("zulu"),
        dial.open_stream("alpha", "peersync/control/1"),
    );
    started.expect("alpha failed to start session");
    let control = control.expect("dial alpha");

    alpha
        .wait_for("PeerConnected", |e| matches!(e, UiEvent::PeerConnected { .. }))
        .await;

    Scripted {
        network,
        alpha,
        control,
        inbox,
    }
}

/// Create a test file with the given content.
pub fn create_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent directories");
    }
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Deterministic, non-repeating-looking test content.
pub fn patterned_bytes(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i * 31 % 251) as u8).collect()
}

/// Poll until `check` holds or the event timeout passes.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
