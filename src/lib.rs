//! Peer-to-peer file and message transfer engine.
//!
//! Two peers meet through a short rendezvous code on a broadcast bus,
//! negotiate a direct encrypted data link, and exchange text and
//! arbitrary-sized files end to end. No file payload ever transits an
//! intermediary: the bus carries only compact signal envelopes.
//!
//! The engine is transport-agnostic behind the
//! [`PeerTransport`]/[`DataChannel`] seams; the production implementation
//! rides WebRTC data channels ([`WebRtcTransport`]). One ordered control
//! channel carries the protocol (hello/heartbeat/text/file handshake);
//! file bytes flow over one or more unordered stripe channels and are
//! resequenced at the receiver.

pub mod core;

pub use crate::core::cancel::CancelToken;
pub use crate::core::config::HostProfile;
pub use crate::core::error::{EngineError, Result};
pub use crate::core::handshake;
pub use crate::core::rendezvous::{RendezvousClient, RendezvousEvent, SignalBus};
pub use crate::core::session::transport::{DataChannel, PeerTransport};
pub use crate::core::session::types::{RemoteCapabilities, SessionEvent, SessionStatus};
pub use crate::core::session::webrtc::WebRtcTransport;
pub use crate::core::session::PeerSession;
pub use crate::core::settings::{EngineConfig, Preferences, TurnConfig};
pub use crate::core::signal::{decode as decode_signal, encode as encode_signal};
pub use crate::core::transfer::sink::{
    ByteSink, FileSink, FileSource, FsSource, MemorySink, MemorySinkHandle, MemorySource,
};
