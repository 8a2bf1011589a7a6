//! PeerSync wire protocol.
//!
//! Peers exchange JSON message envelopes over a per-peer control stream,
//! one envelope per [`frame`]:
//!
//! ```text
//! {"SourceID":"laptop","SourcePlatform":"linux","FmtType":"FILE_DROP",
//!  "State":"INFO","Command":"SRC","TimeStamp":42,"ExtData":{...}}
//! ```
//!
//! `State` and `Command` describe the sender's new local state. The shape of
//! `ExtData` is fixed by the `(FmtType, Command)` pair, so decoding reads the
//! envelope first and then dispatches to the matching [`ExtData`] variant.
//! An unknown pair fails that one message with `UnknownMessageShape`.

pub mod frame;

pub use frame::{
    read_frame, timed, write_frame, Frame, FrameKind, StreamHello, HEADER_LEN, MAGIC,
    MAX_FRAME_BODY,
};

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::file::{DropCmd, FileDropData};

/// Payload format of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FmtType {
    /// Plain text clipboard, carried inline in the envelope
    TextCb,
    /// Image-only clipboard, for peers without the combined format
    ImageCb,
    /// Combined text+image+html clipboard bundle
    XclipCb,
    /// Dropped or dragged files
    FileDrop,
}

impl FmtType {
    /// Wire name of the format.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TextCb => "TEXT_CB",
            Self::ImageCb => "IMAGE_CB",
            Self::XclipCb => "XCLIP_CB",
            Self::FileDrop => "FILE_DROP",
        }
    }

    /// Parse a wire name.
    #[must_use]
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "TEXT_CB" => Some(Self::TextCb),
            "IMAGE_CB" => Some(Self::ImageCb),
            "XCLIP_CB" => Some(Self::XclipCb),
            "FILE_DROP" => Some(Self::FileDrop),
            _ => None,
        }
    }

    /// Whether payloads of this format travel over a dedicated clipboard stream.
    #[must_use]
    pub const fn uses_clipboard_stream(self) -> bool {
        matches!(self, Self::ImageCb | Self::XclipCb)
    }
}

impl fmt::Display for FmtType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exchange state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// New content announced locally
    Init,
    /// Content description exchanged
    Info,
    /// Transfer negotiated
    Trans,
    /// Bytes moving over the format stream
    Io,
}

impl State {
    /// All states, in protocol order.
    pub const ALL: [Self; 4] = [Self::Init, Self::Info, Self::Trans, Self::Io];

    /// Wire name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Info => "INFO",
            Self::Trans => "TRANS",
            Self::Io => "IO",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// Initiator / sender
    Src,
    /// Acceptor / receiver
    Dst,
}

impl Role {
    /// Both roles.
    pub const ALL: [Self; 2] = [Self::Src, Self::Dst];

    /// The role the peer holds when we hold this one.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Src => Self::Dst,
            Self::Dst => Self::Src,
        }
    }

    /// Wire name of the role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Src => "SRC",
            Self::Dst => "DST",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope command: a role, or a transfer-control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    /// Sender-side state message
    Src,
    /// Receiver-side state message
    Dst,
    /// The sender aborted a transfer
    SrcInterrupt,
    /// The receiver aborted a transfer
    DstInterrupt,
    /// The receiver asks to resume an interrupted transfer
    RecoverRequest,
    /// The sender answers a resume request
    RecoverResponse,
    /// A queued transfer was withdrawn before any bytes moved
    Cancel,
    /// The peer is going away
    Disconnect,
}

impl Command {
    /// The role carried by a state message, or `None` for control commands.
    #[must_use]
    pub const fn role(self) -> Option<Role> {
        match self {
            Self::Src => Some(Role::Src),
            Self::Dst => Some(Role::Dst),
            _ => None,
        }
    }

    /// Control commands bypass the transition table and act immediately.
    #[must_use]
    pub const fn is_control(self) -> bool {
        self.role().is_none()
    }

    /// Wire name of the command.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Src => "SRC",
            Self::Dst => "DST",
            Self::SrcInterrupt => "SRC_INTERRUPT",
            Self::DstInterrupt => "DST_INTERRUPT",
            Self::RecoverRequest => "RECOVER_REQUEST",
            Self::RecoverResponse => "RECOVER_RESPONSE",
            Self::Cancel => "CANCEL",
            Self::Disconnect => "DISCONNECT",
        }
    }
}

impl From<Role> for Command {
    fn from(role: Role) -> Self {
        match role {
            Role::Src => Self::Src,
            Role::Dst => Self::Dst,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a transfer was interrupted, as reported to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptCode {
    /// Cancelled by a user
    Cancelled,
    /// A source file could not be opened
    FileNotFound,
    /// Fewer bytes arrived than declared
    CopyIncomplete,
    /// A read or write timed out
    Timeout,
    /// The transfer stream could not be opened or broke
    StreamFailed,
    /// A declared path was unsafe
    InvalidPath,
    /// The receiver had no room for another transfer
    QueueFull,
    /// The transfer was never accepted on this side
    NotAccepted,
    /// Any other I/O failure
    Io,
}

impl fmt::Display for InterruptCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cancelled => "cancelled",
            Self::FileNotFound => "file not found",
            Self::CopyIncomplete => "incomplete copy",
            Self::Timeout => "timed out",
            Self::StreamFailed => "stream failed",
            Self::InvalidPath => "invalid path",
            Self::QueueFull => "queue full",
            Self::NotAccepted => "not accepted",
            Self::Io => "I/O error",
        };
        f.write_str(name)
    }
}

/// Inline text clipboard content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TextPayload {
    /// Clipboard text
    pub text: String,
}

/// Segment lengths of a clipboard payload sent over a clipboard stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClipboardHeader {
    /// Text segment length
    pub text_len: u64,
    /// Image segment length
    pub image_len: u64,
    /// HTML segment length
    pub html_len: u64,
    /// Image width in pixels
    #[serde(default)]
    pub width: u32,
    /// Image height in pixels
    #[serde(default)]
    pub height: u32,
}

impl ClipboardHeader {
    /// Total payload length in bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if the segment lengths do not fit in a `u64`.
    pub fn total_len(&self) -> Result<u64> {
        self.text_len
            .checked_add(self.image_len)
            .and_then(|len| len.checked_add(self.html_len))
            .ok_or_else(|| Error::Protocol("clipboard segment lengths overflow".to_string()))
    }
}

/// The receiver's answer to a file-drop request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DropResponse {
    /// Transfer identity
    #[serde(rename = "TimeStamp")]
    pub timestamp: u64,
    /// `ACCEPT` or `REJECT`
    pub cmd: DropCmd,
    /// Where the receiver will write the files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_path: Option<String>,
}

/// Details of an interrupted transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InterruptPayload {
    /// Transfer identity (snapshot timestamp for clipboard exchanges)
    #[serde(rename = "TimeStamp")]
    pub timestamp: u64,
    /// Failure cause
    pub code: InterruptCode,
    /// File being copied when the transfer stopped
    #[serde(default)]
    pub last_file: String,
    /// Bytes of that file copied before the stop
    #[serde(default)]
    pub offset: u64,
    /// Human-readable description
    #[serde(default)]
    pub detail: String,
}

/// The sender's answer to a resume request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RecoverResponse {
    /// Transfer identity
    #[serde(rename = "TimeStamp")]
    pub timestamp: u64,
    /// Whether the sender will resume
    pub accepted: bool,
}

/// Withdrawal of a transfer that has not started moving bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CancelPayload {
    /// Transfer identity
    #[serde(rename = "TimeStamp")]
    pub timestamp: u64,
}

/// Format-dependent extension payload of an envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtData {
    /// No payload (`null` on the wire)
    Empty,
    /// `TEXT_CB` + `SRC`
    Text(TextPayload),
    /// `IMAGE_CB`/`XCLIP_CB` + `SRC`
    ClipboardHeader(ClipboardHeader),
    /// `FILE_DROP` + `SRC`
    FileDrop(FileDropData),
    /// `FILE_DROP` + `DST`
    DropResponse(DropResponse),
    /// Any format + `SRC_INTERRUPT`/`DST_INTERRUPT`
    Interrupt(InterruptPayload),
    /// `FILE_DROP` + `RECOVER_REQUEST`
    RecoverRequest(FileDropData),
    /// `FILE_DROP` + `RECOVER_RESPONSE`
    RecoverResponse(RecoverResponse),
    /// `FILE_DROP` + `CANCEL`
    Cancel(CancelPayload),
}

impl ExtData {
    fn to_value(&self) -> Result<Value> {
        let value = match self {
            Self::Empty => Ok(Value::Null),
            Self::Text(p) => serde_json::to_value(p),
            Self::ClipboardHeader(p) => serde_json::to_value(p),
            Self::FileDrop(p) | Self::RecoverRequest(p) => serde_json::to_value(p),
            Self::DropResponse(p) => serde_json::to_value(p),
            Self::Interrupt(p) => serde_json::to_value(p),
            Self::RecoverResponse(p) => serde_json::to_value(p),
            Self::Cancel(p) => serde_json::to_value(p),
        };
        value.map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode the payload shape selected by `(fmt, command)`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownMessageShape` for a pair with no defined shape and
    /// `Serialization` when the value does not match the selected shape.
    pub fn decode(fmt: FmtType, command: Command, value: Value) -> Result<Self> {
        fn shape<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T> {
            serde_json::from_value(value).map_err(|e| Error::Serialization(e.to_string()))
        }

        match (fmt, command) {
            (FmtType::TextCb, Command::Src) => shape(value).map(Self::Text),
            (FmtType::ImageCb | FmtType::XclipCb, Command::Src) => {
                let header: ClipboardHeader = shape(value)?;
                header.total_len()?;
                Ok(Self::ClipboardHeader(header))
            }
            (FmtType::TextCb | FmtType::ImageCb | FmtType::XclipCb, Command::Dst)
            | (_, Command::Disconnect) => Ok(Self::Empty),
            (FmtType::FileDrop, Command::Src) => shape(value).map(Self::FileDrop),
            (FmtType::FileDrop, Command::Dst) => shape(value).map(Self::DropResponse),
            (_, Command::SrcInterrupt | Command::DstInterrupt) => {
                shape(value).map(Self::Interrupt)
            }
            (FmtType::FileDrop, Command::RecoverRequest) => {
                shape(value).map(Self::RecoverRequest)
            }
            (FmtType::FileDrop, Command::RecoverResponse) => {
                shape(value).map(Self::RecoverResponse)
            }
            (FmtType::FileDrop, Command::Cancel) => shape(value).map(Self::Cancel),
            (fmt, command) => Err(Error::UnknownMessageShape {
                format: fmt.to_string(),
                command: command.to_string(),
            }),
        }
    }
}

/// A decoded message envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Identity of the sending peer
    pub source_id: String,
    /// Platform tag of the sending peer
    pub source_platform: String,
    /// Payload format
    pub fmt: FmtType,
    /// Sender's new state
    pub state: State,
    /// Sender's role, or a control command
    pub command: Command,
    /// Transfer timestamp for file drops, snapshot timestamp for clipboard
    pub timestamp: u64,
    /// Extension payload
    pub ext: ExtData,
}

#[derive(Serialize)]
struct EnvelopeOut<'a> {
    #[serde(rename = "SourceID")]
    source_id: &'a str,
    #[serde(rename = "SourcePlatform")]
    source_platform: &'a str,
    #[serde(rename = "FmtType")]
    fmt: FmtType,
    #[serde(rename = "State")]
    state: State,
    #[serde(rename = "Command")]
    command: Command,
    #[serde(rename = "TimeStamp")]
    timestamp: u64,
    #[serde(rename = "ExtData")]
    ext: Value,
}

#[derive(Deserialize)]
struct EnvelopeIn {
    #[serde(rename = "SourceID")]
    source_id: String,
    #[serde(rename = "SourcePlatform", default)]
    source_platform: String,
    #[serde(rename = "FmtType")]
    fmt: FmtType,
    #[serde(rename = "State")]
    state: State,
    #[serde(rename = "Command")]
    command: Command,
    #[serde(rename = "TimeStamp", default)]
    timestamp: u64,
    #[serde(rename = "ExtData", default)]
    ext: Value,
}

impl Message {
    /// Encode the envelope to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let envelope = EnvelopeOut {
            source_id: &self.source_id,
            source_platform: &self.source_platform,
            fmt: self.fmt,
            state: self.state,
            command: self.command,
            timestamp: self.timestamp,
            ext: self.ext.to_value()?,
        };
        frame::to_json(&envelope)
    }

    /// Decode an envelope, then its extension payload.
    ///
    /// # Errors
    ///
    /// Returns a protocol-class error if the envelope or payload is malformed.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let envelope: EnvelopeIn = frame::from_json(data)?;
        let ext = ExtData::decode(envelope.fmt, envelope.command, envelope.ext)?;

        Ok(Self {
            source_id: envelope.source_id,
            source_platform: envelope.source_platform,
            fmt: envelope.fmt,
            state: envelope.state,
            command: envelope.command,
            timestamp: envelope.timestamp,
            ext,
        })
    }

    /// Short description for logs.
    #[must_use]
    pub fn describe(&self) -> String {
        format!(
            "{}/{}/{} ts={}",
            self.fmt, self.state, self.command, self.timestamp
        )
    }
}
