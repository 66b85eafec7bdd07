//! Transport seam: the narrow surface the engine needs from a peer
//! connection and its data channels.
//!
//! The production implementation wraps the `webrtc` crate (see
//! [`super::webrtc`]); tests drive the same machinery over an in-memory
//! pair. Handlers are plain callbacks so implementations stay free to
//! invoke them from whatever executor context they own; the session
//! funnels every channel's messages into a per-channel in-order queue
//! with a single consumer before any protocol work happens.

use crate::core::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Data channel lifecycle state, mirroring the underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Peer link state surfaced by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

pub type MessageHandler = Box<dyn Fn(Bytes) + Send + Sync>;
pub type EventHandler = Box<dyn Fn() + Send + Sync>;
pub type ChannelHandler = Box<dyn Fn(Arc<dyn DataChannel>) + Send + Sync>;
pub type LinkStateHandler = Box<dyn Fn(LinkState) + Send + Sync>;

/// One data channel: ordered or unordered, reliable, message-framed.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;
    fn state(&self) -> ChannelState;

    /// Queue one message. Fails with a queue-full error when the
    /// transport's send buffer rejects the frame.
    async fn send(&self, data: Bytes) -> Result<()>;

    /// Bytes queued but not yet handed to the network.
    async fn buffered_amount(&self) -> usize;

    /// Largest message the transport will carry, if it exposes a bound.
    fn max_message_size(&self) -> Option<usize>;

    fn set_on_message(&self, handler: MessageHandler);
    fn set_on_open(&self, handler: EventHandler);
    fn set_on_close(&self, handler: EventHandler);

    async fn close(&self);
}

/// The negotiated peer connection.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Open a new channel. `ordered = false` allows the transport to
    /// deliver messages out of order; reliability is unaffected.
    async fn create_channel(&self, label: &str, ordered: bool) -> Result<Arc<dyn DataChannel>>;

    /// Handler for channels announced by the remote side.
    fn set_on_channel(&self, handler: ChannelHandler);

    fn set_on_state_change(&self, handler: LinkStateHandler);
    fn link_state(&self) -> LinkState;

    /// Produce the local offer description, complete with gathered
    /// candidates.
    async fn create_offer(&self) -> Result<String>;

    /// Apply a remote offer and produce the local answer description.
    async fn create_answer(&self, remote_offer: &str) -> Result<String>;

    /// Apply the remote answer to an offer this transport produced.
    async fn apply_answer(&self, remote_answer: &str) -> Result<()>;

    async fn close(&self);
}
