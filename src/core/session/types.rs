//! Protocol types: control messages, capabilities, statuses, and
//! app-facing events.
//!
//! Pure data layer. Everything crossing the control channel is
//! `Serialize`/`Deserialize`; everything crossing a task boundary is
//! `Clone` + `Debug`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Protocol version advertised in `hello`.
pub const PROTOCOL_VERSION: u32 = 1;

// ── Control messages ─────────────────────────────────────────────────────────

/// Capability bits exchanged in `hello`. Wire values are 0/1 integers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapabilityFlags {
    pub striping: u8,
}

/// Messages on the ordered control channel, JSON-encoded with a `type`
/// discriminator. A raw string that fails to parse is delivered upstream
/// as if it were `{"type":"text","text":<raw>}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// First message after the control channel opens.
    #[serde(rename = "hello")]
    Hello { v: u32, caps: CapabilityFlags },

    /// Heartbeat probe; `t` is the sender's millisecond timestamp.
    #[serde(rename = "hb-ping")]
    HbPing { t: u64 },

    /// Heartbeat echo.
    #[serde(rename = "hb-pong")]
    HbPong { t: u64 },

    /// User-level text message.
    #[serde(rename = "text")]
    Text { text: String },

    /// Announces an outgoing file: id, stripe base, stripe count, name,
    /// total size.
    #[serde(rename = "file-meta")]
    FileMeta {
        id: String,
        sid: String,
        sc: u32,
        name: String,
        size: u64,
    },

    /// Receiver is ready; repeated until acknowledged.
    #[serde(rename = "file-accept")]
    FileAccept { id: String },

    /// Sender acknowledges the accept, stopping the resend loop.
    #[serde(rename = "file-accept-ack")]
    FileAcceptAck { id: String },

    /// Receiver confirms all bytes committed.
    #[serde(rename = "file-done")]
    FileDone { id: String },

    /// Either side aborts the transfer.
    #[serde(rename = "file-cancel")]
    FileCancel { id: String, reason: String },
}

// ── Capabilities ─────────────────────────────────────────────────────────────

/// What the remote advertised in its `hello`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteCapabilities {
    pub version: u32,
    pub striping: bool,
}

// ── Session status ───────────────────────────────────────────────────────────

/// Session status surfaced to callers.
///
/// `PeerTimeout` is not terminal: the next inbound frame returns the
/// session to `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    New,
    Connecting,
    Connected,
    PeerTimeout,
    Disconnected,
    Failed,
    Closed,
}

impl SessionStatus {
    /// Terminal statuses reject all waiters and cancel all transfers.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Disconnected | SessionStatus::Failed | SessionStatus::Closed
        )
    }
}

// ── App-facing events ────────────────────────────────────────────────────────

/// Events delivered from the session to the embedder over an unbounded
/// channel; the embedder drives UI and accept decisions from these.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StatusChanged(SessionStatus),
    /// Inbound text (or any unparseable control payload, verbatim).
    TextReceived(String),
    /// A `file-meta` arrived and a receive slot was allocated; the
    /// embedder decides whether to accept.
    IncomingFile { id: String, name: String, size: u64 },
    SendProgress { id: String, sent: u64, total: u64 },
    ReceiveProgress {
        id: String,
        received: u64,
        total: u64,
    },
    /// The incoming transfer completed. `data` holds the assembled bytes
    /// when the transfer ran without an external sink.
    ReceiveComplete { id: String, data: Option<Bytes> },
    /// The incoming transfer ended before completion.
    ReceiveCancelled { id: String, reason: String },
}
