//! Production transport: the `webrtc` crate behind the [`PeerTransport`]
//! seam.
//!
//! Construction mirrors the session configuration: STUN when enabled,
//! TURN when configured, `iceTransportPolicy = relay` under force-relay,
//! and an explicit SCTP max-message-size bound so the chunk clamp has a
//! real number to work against.

use super::transport::{
    ChannelHandler, ChannelState, DataChannel, EventHandler, LinkState, LinkStateHandler,
    MessageHandler, PeerTransport,
};
use crate::core::config::{ICE_GATHER_TIMEOUT_LOCAL, ICE_GATHER_TIMEOUT_STUN};
use crate::core::error::{EngineError, Result};
use crate::core::settings::EngineConfig;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::{SctpMaxMessageSize, SettingEngine};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Explicit SCTP max message size (1 MiB). A concrete bound instead of
/// "unbounded" because some stacks read 0 as "default 64 KiB".
const SCTP_MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

fn channel_err(e: webrtc::Error) -> EngineError {
    let msg = e.to_string();
    if msg.contains("send queue is full") || msg.contains("buffer full") {
        EngineError::QueueFull
    } else {
        EngineError::ChannelClosed(msg)
    }
}

fn negotiation_err(e: webrtc::Error) -> EngineError {
    EngineError::InvalidFormat(e.to_string())
}

// ── Transport ────────────────────────────────────────────────────────────────

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    gather_timeout: Duration,
}

impl WebRtcTransport {
    /// Build a peer connection from the session configuration.
    pub async fn connect(cfg: &EngineConfig) -> Result<Arc<Self>> {
        let mut media = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(negotiation_err)?;

        let mut settings = SettingEngine::default();
        settings.set_sctp_max_message_size_can_send(SctpMaxMessageSize::Bounded(
            SCTP_MAX_MESSAGE_SIZE,
        ));

        let api = APIBuilder::new()
            .with_setting_engine(settings)
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let mut ice_servers = Vec::new();
        if cfg.use_stun {
            ice_servers.push(RTCIceServer {
                urls: vec![DEFAULT_STUN_URL.into()],
                ..Default::default()
            });
        }
        let mut policy = RTCIceTransportPolicy::All;
        if let Some(turn) = &cfg.turn {
            ice_servers.push(RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
            if turn.force_relay {
                policy = RTCIceTransportPolicy::Relay;
            }
        }

        let pc = api
            .new_peer_connection(RTCConfiguration {
                ice_servers,
                ice_transport_policy: policy,
                ..Default::default()
            })
            .await
            .map_err(negotiation_err)?;

        Ok(Arc::new(Self {
            pc: Arc::new(pc),
            gather_timeout: if cfg.use_stun {
                ICE_GATHER_TIMEOUT_STUN
            } else {
                ICE_GATHER_TIMEOUT_LOCAL
            },
        }))
    }

    /// Wait for candidate gathering to settle, bounded by the configured
    /// timeout. On timeout the description ships with whatever gathered.
    async fn wait_gathering_complete(&self) {
        if self.pc.ice_gathering_state() == RTCIceGatheringState::Complete {
            return;
        }

        let (tx, rx) = oneshot::channel::<()>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        self.pc.on_ice_gathering_state_change(Box::new(move |state| {
            let tx = Arc::clone(&tx);
            Box::pin(async move {
                if state == RTCIceGathererState::Complete {
                    if let Ok(mut guard) = tx.lock() {
                        if let Some(tx) = guard.take() {
                            let _ = tx.send(());
                        }
                    }
                }
            })
        }));

        // Re-check after registering to close the race.
        if self.pc.ice_gathering_state() == RTCIceGatheringState::Complete {
            return;
        }
        if tokio::time::timeout(self.gather_timeout, rx).await.is_err() {
            warn!(
                event = "ice_gather_timeout",
                timeout_ms = self.gather_timeout.as_millis() as u64,
                "Proceeding with partially gathered candidates"
            );
        }
    }

    async fn local_description_sdp(&self) -> Result<String> {
        self.pc
            .local_description()
            .await
            .map(|d| d.sdp)
            .ok_or_else(|| EngineError::InvalidFormat("no local description".into()))
    }
}

fn map_link_state(state: RTCPeerConnectionState) -> LinkState {
    match state {
        RTCPeerConnectionState::New => LinkState::New,
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
        RTCPeerConnectionState::Unspecified => LinkState::New,
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_channel(&self, label: &str, ordered: bool) -> Result<Arc<dyn DataChannel>> {
        let init = RTCDataChannelInit {
            ordered: Some(ordered),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(channel_err)?;
        Ok(WebRtcChannel::wrap(dc))
    }

    fn set_on_channel(&self, handler: ChannelHandler) {
        self.pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            handler(WebRtcChannel::wrap(dc));
            Box::pin(async {})
        }));
    }

    fn set_on_state_change(&self, handler: LinkStateHandler) {
        self.pc
            .on_peer_connection_state_change(Box::new(move |state| {
                handler(map_link_state(state));
                Box::pin(async {})
            }));
    }

    fn link_state(&self) -> LinkState {
        map_link_state(self.pc.connection_state())
    }

    async fn create_offer(&self) -> Result<String> {
        let offer = self.pc.create_offer(None).await.map_err(negotiation_err)?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(negotiation_err)?;
        self.wait_gathering_complete().await;
        self.local_description_sdp().await
    }

    async fn create_answer(&self, remote_offer: &str) -> Result<String> {
        let remote = RTCSessionDescription::offer(remote_offer.to_string())
            .map_err(negotiation_err)?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(negotiation_err)?;

        let answer = self.pc.create_answer(None).await.map_err(negotiation_err)?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(negotiation_err)?;
        self.wait_gathering_complete().await;
        self.local_description_sdp().await
    }

    async fn apply_answer(&self, remote_answer: &str) -> Result<()> {
        let remote = RTCSessionDescription::answer(remote_answer.to_string())
            .map_err(negotiation_err)?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(negotiation_err)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!(event = "peer_connection_close_error", error = %e);
        }
    }
}

// ── Channel wrapper ──────────────────────────────────────────────────────────

struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
}

impl WebRtcChannel {
    fn wrap(dc: Arc<RTCDataChannel>) -> Arc<dyn DataChannel> {
        let label = dc.label().to_string();
        Arc::new(Self { dc, label })
    }
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> ChannelState {
        match self.dc.ready_state() {
            RTCDataChannelState::Connecting | RTCDataChannelState::Unspecified => {
                ChannelState::Connecting
            }
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing => ChannelState::Closing,
            RTCDataChannelState::Closed => ChannelState::Closed,
        }
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        self.dc.send(&data).await.map(|_| ()).map_err(channel_err)
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    fn max_message_size(&self) -> Option<usize> {
        Some(SCTP_MAX_MESSAGE_SIZE as usize)
    }

    fn set_on_message(&self, handler: MessageHandler) {
        self.dc.on_message(Box::new(move |msg: DataChannelMessage| {
            handler(msg.data);
            Box::pin(async {})
        }));
    }

    fn set_on_open(&self, handler: EventHandler) {
        self.dc.on_open(Box::new(move || {
            handler();
            Box::pin(async {})
        }));
    }

    fn set_on_close(&self, handler: EventHandler) {
        self.dc.on_close(Box::new(move || {
            handler();
            Box::pin(async {})
        }));
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            debug!(event = "channel_close_error", label = %self.label, error = %e);
        }
    }
}
