//! Console rendering of engine notifications.

use peersync_core::file::{format_size, TransferProgress};
use peersync_core::ui::{UiEvent, UiSink};

/// Prints engine notifications as text lines or JSON objects.
#[derive(Debug, Clone, Copy)]
pub struct ConsoleUi {
    json: bool,
}

impl ConsoleUi {
    /// Create a console sink.
    #[must_use]
    pub const fn new(json: bool) -> Self {
        Self { json }
    }
}

impl UiSink for ConsoleUi {
    fn notify(&self, event: UiEvent) {
        if self.json {
            println!("{}", to_json(&event));
        } else {
            println!("  {}", describe(&event));
        }
    }
}

fn progress_line(p: &TransferProgress) -> String {
    format!(
        "[{}] {} {}: {:.1}% of {} ({}/s)",
        p.timestamp,
        p.direction,
        p.current_file_name,
        p.percentage(),
        format_size(p.total_bytes),
        format_size(p.speed_bps)
    )
}

/// One human-readable line for an event.
fn describe(event: &UiEvent) -> String {
    match event {
        UiEvent::PeerConnected { peer } => format!("Connected to {peer}"),
        UiEvent::PeerDisconnected { peer } => format!("{peer} disconnected"),
        UiEvent::ClipboardReceived {
            peer,
            format,
            bytes,
        } => format!("Clipboard from {peer} ({format}, {})", format_size(*bytes)),
        UiEvent::FileDropRequest { peer, descriptor } => format!(
            "{peer} wants to send {} file(s), {} [/accept {peer} {ts} | /reject {peer} {ts}]",
            descriptor.files.len(),
            descriptor.total_desc,
            ts = descriptor.timestamp
        ),
        UiEvent::FolderCreated { path, .. } => format!("Created {}", path.display()),
        UiEvent::Progress(p) => progress_line(p),
        UiEvent::TransferCompleted {
            peer,
            timestamp,
            direction,
            files,
        } => {
            if files.is_empty() {
                format!("[{timestamp}] {direction} to {peer} complete")
            } else {
                format!(
                    "[{timestamp}] {direction} from {peer} complete: {} file(s)",
                    files.len()
                )
            }
        }
        UiEvent::TransferRejected { peer, timestamp } => {
            format!("[{timestamp}] {peer} declined the files")
        }
        UiEvent::TransferFailed {
            peer,
            timestamp,
            format,
            code,
            cancelled_locally,
            detail,
            ..
        } => {
            if *cancelled_locally {
                format!("[{timestamp}] Cancelled {format} exchange with {peer}")
            } else {
                format!("[{timestamp}] {format} exchange with {peer} failed ({code}): {detail}")
            }
        }
        UiEvent::TransferCancelled {
            peer,
            timestamp,
            by_peer,
        } => {
            if *by_peer {
                format!("[{timestamp}] {peer} withdrew the transfer")
            } else {
                format!("[{timestamp}] Withdrawn")
            }
        }
        UiEvent::RecoverResult {
            peer,
            timestamp,
            accepted,
        } => {
            if *accepted {
                format!("[{timestamp}] {peer} resumes the transfer")
            } else {
                format!("[{timestamp}] {peer} cannot resume the transfer")
            }
        }
        UiEvent::Error { peer: Some(peer), message } => format!("Error with {peer}: {message}"),
        UiEvent::Error { peer: None, message } => format!("Error: {message}"),
    }
}

fn to_json(event: &UiEvent) -> serde_json::Value {
    let now = chrono::Utc::now().to_rfc3339();
    let mut value = match event {
        UiEvent::PeerConnected { peer } => serde_json::json!({ "event": "connected", "peer": peer }),
        UiEvent::PeerDisconnected { peer } => {
            serde_json::json!({ "event": "disconnected", "peer": peer })
        }
        UiEvent::ClipboardReceived {
            peer,
            format,
            bytes,
        } => serde_json::json!({
            "event": "clipboard",
            "peer": peer,
            "format": format.to_string(),
            "bytes": bytes,
        }),
        UiEvent::FileDropRequest { peer, descriptor } => serde_json::json!({
            "event": "file_drop_request",
            "peer": peer,
            "timestamp": descriptor.timestamp,
            "files": descriptor.files.iter().map(|f| serde_json::json!({
                "name": &f.name,
                "size": f.size(),
            })).collect::<Vec<_>>(),
            "total_size": descriptor.total_size,
        }),
        UiEvent::FolderCreated {
            peer,
            timestamp,
            path,
        } => serde_json::json!({
            "event": "folder_created",
            "peer": peer,
            "timestamp": timestamp,
            "path": path.display().to_string(),
        }),
        UiEvent::Progress(p) => serde_json::json!({
            "event": "progress",
            "peer": &p.peer,
            "timestamp": p.timestamp,
            "direction": p.direction.to_string(),
            "file": &p.current_file_name,
            "bytes_transferred": p.bytes_transferred,
            "total_bytes": p.total_bytes,
            "speed_bps": p.speed_bps,
        }),
        UiEvent::TransferCompleted {
            peer,
            timestamp,
            direction,
            files,
        } => serde_json::json!({
            "event": "completed",
            "peer": peer,
            "timestamp": timestamp,
            "direction": direction.to_string(),
            "files": files.iter().map(|f| f.display().to_string()).collect::<Vec<_>>(),
        }),
        UiEvent::TransferRejected { peer, timestamp } => serde_json::json!({
            "event": "rejected",
            "peer": peer,
            "timestamp": timestamp,
        }),
        UiEvent::TransferFailed {
            peer,
            timestamp,
            format,
            side,
            code,
            cancelled_locally,
            detail,
        } => serde_json::json!({
            "event": "failed",
            "peer": peer,
            "timestamp": timestamp,
            "format": format.to_string(),
            "side": format!("{side:?}").to_lowercase(),
            "code": code.to_string(),
            "cancelled_locally": cancelled_locally,
            "detail": detail,
        }),
        UiEvent::TransferCancelled {
            peer,
            timestamp,
            by_peer,
        } => serde_json::json!({
            "event": "cancelled",
            "peer": peer,
            "timestamp": timestamp,
            "by_peer": by_peer,
        }),
        UiEvent::RecoverResult {
            peer,
            timestamp,
            accepted,
        } => serde_json::json!({
            "event": "recover",
            "peer": peer,
            "timestamp": timestamp,
            "accepted": accepted,
        }),
        UiEvent::Error { peer, message } => serde_json::json!({
            "event": "error",
            "peer": peer,
            "message": message,
        }),
    };
    value["at"] = serde_json::Value::String(now);
    value
}
