//! Run command implementation.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use peersync_core::clipboard::{ClipPayload, ClipboardPoller, MemoryClipboard};
use peersync_core::file::format_size;
use peersync_core::roster::{ClientInfo, Roster};
use peersync_core::session::LocalIdentity;
use peersync_core::transport::{tcp, TcpTransport};
use peersync_core::SyncEngine;

use super::RunArgs;
use crate::ui::ConsoleUi;

/// Parse a `--peer` value of the form `ID=HOST:PORT`.
pub fn parse_peer(value: &str) -> Result<(String, SocketAddr), String> {
    let (id, addr) = value
        .split_once('=')
        .ok_or_else(|| format!("expected ID=HOST:PORT, got '{value}'"))?;
    if id.is_empty() {
        return Err("peer id is empty".to_string());
    }
    let addr = addr
        .parse()
        .map_err(|e| format!("invalid address '{addr}': {e}"))?;
    Ok((id.to_string(), addr))
}

/// One line typed at the prompt.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Send { peer: String, paths: Vec<PathBuf> },
    Answer { peer: String, timestamp: u64, accept: bool },
    Cancel { peer: String, timestamp: u64 },
    Recover { peer: String, timestamp: u64 },
    Queue { peer: String },
    Copy(String),
    Peers,
    Help,
    Quit,
}

const HELP: &str = "\
  /send PEER PATH...      offer files or folders
  /accept PEER ID         accept an incoming drop
  /reject PEER ID         reject an incoming drop
  /cancel PEER ID         cancel a queued or running transfer
  /recover PEER ID        ask the sender to resume an interrupted transfer
  /queue PEER             list queued and interrupted transfers
  /copy TEXT              put text on the shared clipboard (same as a plain line)
  /peers                  list connected peers
  /quit                   disconnect and exit";

fn parse_input(line: &str) -> Result<Input> {
    if !line.trim_start().starts_with('/') && !line.trim().is_empty() {
        return Ok(Input::Copy(line.to_string()));
    }
    let line = line.trim();
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let mut words = rest.split_whitespace();
    let mut peer = || {
        words
            .next()
            .map(str::to_string)
            .context("missing peer id")
    };

    let input = match command {
        "/send" => {
            let peer = peer()?;
            let paths: Vec<PathBuf> = words.map(PathBuf::from).collect();
            if paths.is_empty() {
                bail!("nothing to send");
            }
            Input::Send { peer, paths }
        }
        "/accept" | "/reject" | "/cancel" | "/recover" => {
            let peer = peer()?;
            let timestamp = words
                .next()
                .context("missing transfer id")?
                .parse()
                .context("transfer id must be a number")?;
            match command {
                "/accept" => Input::Answer { peer, timestamp, accept: true },
                "/reject" => Input::Answer { peer, timestamp, accept: false },
                "/cancel" => Input::Cancel { peer, timestamp },
                _ => Input::Recover { peer, timestamp },
            }
        }
        "/queue" => Input::Queue { peer: peer()? },
        "/copy" if !rest.is_empty() => Input::Copy(rest.to_string()),
        "/copy" => bail!("nothing to copy"),
        "/peers" => Input::Peers,
        "/help" | "" => Input::Help,
        "/quit" | "/exit" => Input::Quit,
        other => bail!("unknown command '{other}', try /help"),
    };
    Ok(input)
}

/// Run the run command.
pub async fn run(args: RunArgs) -> Result<()> {
    let mut config = super::load_config();
    if let Some(dir) = args.download_dir {
        config.general.download_dir = Some(dir);
    }
    if args.auto_accept {
        config.transfer.auto_accept = true;
    }
    if args.no_clipboard {
        config.clipboard.enabled = false;
    }

    let roster = Roster::new();
    for (id, addr) in &args.peers {
        roster
            .upsert(ClientInfo {
                id: id.clone(),
                ip: addr.ip(),
                port: addr.port(),
                platform: String::new(),
                device_name: id.clone(),
                supports_extended_clipboard: config.clipboard.extended_format,
            })
            .await;
    }

    let clipboard = Arc::new(MemoryClipboard::new());
    let transport = TcpTransport::new(args.id.clone(), roster.clone(), config.session.connect_timeout);
    let identity = LocalIdentity::from_config(args.id.clone(), &config);
    let engine = SyncEngine::new(
        identity,
        config.clone(),
        Arc::new(transport),
        roster,
        clipboard.clone(),
        Arc::new(ConsoleUi::new(args.json)),
    )?;

    let cancel = CancellationToken::new();
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    let listen_task = tokio::spawn(tcp::listen(listener, engine.stream_handler(), cancel.clone()));
    let poller = config.clipboard.enabled.then(|| {
        ClipboardPoller::new().start(clipboard.clone(), engine.clipboard().clone(), cancel.clone())
    });

    if !args.json {
        println!();
        println!("PeerSync v{}", peersync_core::VERSION);
        println!("{}", "-".repeat(37));
        println!("  Device:    {} ({})", args.id, config.general.device_name);
        println!("  Listening: {}", args.listen);
        println!(
            "  Downloads: {}",
            config.general.resolved_download_dir().display()
        );
        println!();
        println!("  Type /help for commands.");
        println!();
    }

    for (peer, _) in &args.peers {
        let engine = engine.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.start_process_for_peer(&peer).await {
                tracing::warn!("Could not connect to {}: {}", peer, e);
            }
        });
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };

        let input = match parse_input(&line) {
            Ok(input) => input,
            Err(e) => {
                eprintln!("  {e}");
                continue;
            }
        };
        if input == Input::Quit {
            break;
        }
        if let Err(e) = execute(&engine, &clipboard, input).await {
            eprintln!("  Error: {e}");
        }
    }

    tracing::info!("Shutting down");
    engine.send_disconnect_to_all_peers().await;
    engine.cancel_all_sessions().await;
    cancel.cancel();
    if let Some(poller) = poller {
        let _ = poller.await;
    }
    listen_task.await??;
    Ok(())
}

async fn execute(engine: &SyncEngine, clipboard: &MemoryClipboard, input: Input) -> Result<()> {
    match input {
        Input::Send { peer, paths } => {
            let timestamp = engine.send_files(&peer, &paths).await?;
            println!("  Offered transfer {timestamp} to {peer}");
        }
        Input::Answer {
            peer,
            timestamp,
            accept,
        } => engine.respond_to_file_drop(&peer, timestamp, accept).await?,
        Input::Cancel { peer, timestamp } => engine.cancel_transfer(&peer, timestamp).await?,
        Input::Recover { peer, timestamp } => engine.recover_transfer(&peer, timestamp).await?,
        Input::Queue { peer } => {
            let queued = engine.queued_transfers(&peer).await;
            let pending = engine.pending_file_drops(&peer).await;
            let interrupted = engine.interrupted_transfers(&peer).await;
            if queued.is_empty() && pending.is_empty() && interrupted.is_empty() {
                println!("  Nothing queued for {peer}");
            }
            for entry in queued {
                println!(
                    "  {}  {:<8} {} file(s), {}{}",
                    entry.timestamp,
                    entry.direction,
                    entry.files,
                    format_size(entry.total_size),
                    if entry.started { "" } else { " (waiting)" }
                );
            }
            for request in pending {
                println!(
                    "  {}  pending  {} file(s), {}",
                    request.timestamp,
                    request.files.len(),
                    request.total_desc
                );
            }
            for (direction, record) in interrupted {
                println!(
                    "  {}  {:<8} interrupted at {}",
                    record.timestamp,
                    direction,
                    record
                        .interrupt
                        .as_ref()
                        .map_or("start", |i| i.last_file.as_str())
                );
            }
        }
        Input::Copy(text) => clipboard.set(ClipPayload::Text(text)),
        Input::Peers => {
            let peers = engine.active_peers().await;
            if peers.is_empty() {
                println!("  No connected peers");
            }
            for peer in peers {
                println!("  {peer}");
            }
        }
        Input::Help => println!("{HELP}"),
        Input::Quit => {}
    }
    Ok(())
}
