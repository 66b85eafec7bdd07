//! Centralized configuration constants for the transfer engine.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format constants (signal prefixes, frame
//! header layout) stay with their codecs.

use std::time::Duration;

// ── Channel labels ───────────────────────────────────────────────────────────

/// Label of the single ordered, reliable control channel.
pub const CONTROL_CHANNEL_LABEL: &str = "sharefile-ctrl";

/// Label prefix of file channels; the suffix is the stream id
/// (`<base>` for stripe 0, `<base>:<k>` for stripe k ≥ 1).
pub const FILE_CHANNEL_PREFIX: &str = "sharefile-file:";

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Target chunk size in bytes (256 KiB). Clamped against the transport's
/// maximum message size, minus the frame header.
pub const CHUNK_SIZE_TARGET: usize = 256 * 1024;

/// Binary frame header: 4 bytes big-endian seq + 4 bytes big-endian len.
pub const FRAME_HEADER_BYTES: usize = 8;

/// Per-budget send window in fast mode. The pump pushes chunks for this
/// long, then yields so inbound traffic and timers get a turn.
pub const SEND_BUDGET_FAST: Duration = Duration::from_millis(180);

/// Per-budget send window in normal mode.
pub const SEND_BUDGET: Duration = Duration::from_millis(32);

/// Floor for the adaptive high watermark after queue-full shrinking.
pub const WATERMARK_FLOOR: usize = 1024 * 1024;

/// Buffered-amount target to drain to after a queue-full rejection,
/// before the refused frame is retransmitted.
pub const QUEUE_FULL_DRAIN_TARGET: usize = 1024 * 1024;

/// Poll interval for buffered-amount waits.
pub const BUFFER_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound on stripe channels for a single file.
pub const MAX_STRIPES: usize = 8;

// ── Protocol timeouts ────────────────────────────────────────────────────────

/// How long the sender waits for `file-accept` after `file-meta`.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(600);

/// How long the sender waits for `file-done` after the last chunk
/// (unordered file channels only).
pub const DONE_TIMEOUT: Duration = Duration::from_secs(600);

/// Interval between `file-accept` retransmissions while the ack is missing.
pub const ACCEPT_RESEND_INTERVAL: Duration = Duration::from_millis(700);

/// Maximum `file-accept` transmissions per incoming transfer.
pub const ACCEPT_RESEND_MAX: u32 = 20;

/// Timeout for opening a file channel.
pub const FILE_CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(15);

/// Default wait for the remote `hello` before giving up on capabilities.
pub const CAPS_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

// ── Heartbeat / liveness ─────────────────────────────────────────────────────

/// Interval between `hb-ping` messages once the control channel is open.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1200);

/// Inactivity window after which the peer is reported timed out.
/// Not terminal: any inbound frame flips the status back.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

// ── ICE gathering ────────────────────────────────────────────────────────────

/// ICE gathering wait when a STUN server is configured. Server-reflexive
/// candidates can take several round trips behind restrictive NATs.
pub const ICE_GATHER_TIMEOUT_STUN: Duration = Duration::from_secs(15);

/// ICE gathering wait with host candidates only.
pub const ICE_GATHER_TIMEOUT_LOCAL: Duration = Duration::from_secs(7);

// ── Rendezvous ───────────────────────────────────────────────────────────────

/// Interval between `{type:"join"}` beacons while waiting for the offer,
/// and between offer re-broadcasts while waiting for the answer.
pub const RENDEZVOUS_RESEND_INTERVAL: Duration = Duration::from_secs(3);

/// Minimum gap between identical rendezvous error reports.
pub const RENDEZVOUS_ERROR_DEBOUNCE: Duration = Duration::from_secs(4);

// ── Receiver write queue ─────────────────────────────────────────────────────

/// Consumed-prefix length above which the write queue considers
/// compacting its backing storage.
pub const WRITE_QUEUE_COMPACT_MIN: usize = 4096;

// ── Host profile ─────────────────────────────────────────────────────────────

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: usize = 1024 * 1024;

/// Host characteristics that scale buffers and stripe counts.
///
/// Memory is supplied by the embedder; `None` selects the default tier.
/// Concurrency defaults to `std::thread::available_parallelism`.
#[derive(Debug, Clone, Copy)]
pub struct HostProfile {
    pub memory_bytes: Option<u64>,
    pub concurrency: usize,
}

impl HostProfile {
    pub fn detect() -> Self {
        Self {
            memory_bytes: None,
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }

    /// Per-channel high watermark for outbound buffering.
    ///
    /// Tiers: 8 MiB below 2 GiB, 16 MiB default, 32 MiB at ≥ 4 GiB,
    /// 64 MiB at ≥ 8 GiB.
    pub fn high_watermark(&self) -> usize {
        match self.memory_bytes {
            Some(m) if m >= 8 * GIB => 64 * MIB,
            Some(m) if m >= 4 * GIB => 32 * MIB,
            Some(m) if m < 2 * GIB => 8 * MIB,
            _ => 16 * MIB,
        }
    }

    /// Sink flush batch target: 4 MiB default, 8 MiB at ≥ 4 GiB, 16 MiB
    /// at ≥ 8 GiB, doubled in fast mode.
    pub fn write_batch_target(&self, fast: bool) -> usize {
        let base = match self.memory_bytes {
            Some(m) if m >= 8 * GIB => 16 * MIB,
            Some(m) if m >= 4 * GIB => 8 * MIB,
            _ => 4 * MIB,
        };
        if fast {
            base * 2
        } else {
            base
        }
    }

    /// Stripe channels to open for one outgoing file when striping is
    /// negotiated: base 2, 3 at ≥ 4 GiB, 4 at ≥ 8 GiB, at most 2 on hosts
    /// with ≤ 4 hardware threads, clamped to `[1, MAX_STRIPES]`.
    pub fn stripe_count(&self) -> usize {
        let mut n: usize = match self.memory_bytes {
            Some(m) if m >= 8 * GIB => 4,
            Some(m) if m >= 4 * GIB => 3,
            _ => 2,
        };
        if self.concurrency <= 4 {
            n = n.min(2);
        }
        n.clamp(1, MAX_STRIPES)
    }
}

impl Default for HostProfile {
    fn default() -> Self {
        Self::detect()
    }
}
