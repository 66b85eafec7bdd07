//! Engine error taxonomy.
//!
//! Every failure the engine can surface maps onto one of these kinds.
//! Recoverable conditions (`QueueFull` during a send, a peer timeout)
//! are handled where they occur and only escape when unrecoverable.

use thiserror::Error;

/// Errors surfaced by the transfer engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed input: unknown signal prefix, undecodable body, bad JSON.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// A compressed signal was received but no decompressor is available.
    #[error("decompression unavailable")]
    DecompressionUnavailable,

    /// Operation requires an open control channel.
    #[error("not connected")]
    NotConnected,

    /// The underlying channel closed while an operation was in flight.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// A bounded wait expired.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The transport's send queue rejected a frame. Handled locally by
    /// watermark adjustment; escapes only if the drain never completes.
    #[error("send queue is full")]
    QueueFull,

    /// The operation was cancelled locally.
    #[error("cancelled")]
    Cancelled,

    /// The remote peer cancelled the transfer.
    #[error("cancelled by peer: {0}")]
    PeerCancelled(String),

    /// The byte sink rejected a write, close, or abort.
    #[error("sink error: {0}")]
    SinkError(String),

    /// The peer violated the protocol contract.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

impl EngineError {
    /// Whether an error should be treated as a transport queue rejection.
    ///
    /// Recognition is by kind or by the well-known message fragment the
    /// underlying stack emits, so adapters that cannot classify their own
    /// errors still trigger watermark adaptation.
    pub fn is_queue_full(&self) -> bool {
        matches!(self, EngineError::QueueFull)
            || self.to_string().contains("send queue is full")
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_full_recognised_by_kind_and_message() {
        assert!(EngineError::QueueFull.is_queue_full());
        assert!(!EngineError::NotConnected.is_queue_full());
        assert!(
            EngineError::ChannelClosed("send queue is full".into()).is_queue_full(),
            "message-based recognition must work for wrapped transport errors"
        );
    }
}
