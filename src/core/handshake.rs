//! Handshake orchestration: glues the signal codec, the rendezvous
//! client, and the peer session.
//!
//! The host publishes its offer when the room opens and re-publishes on
//! every `{type:"join"}` beacon (plus a periodic resend) until the first
//! valid answer is applied. The joiner beacons `{type:"join"}` until the
//! first offer arrives, answers it, and publishes the answer. Both sides
//! then converge on the session reporting `connected`.

use crate::core::config::RENDEZVOUS_RESEND_INTERVAL;
use crate::core::error::{EngineError, Result};
use crate::core::rendezvous::{RendezvousClient, RendezvousEvent};
use crate::core::session::types::SessionStatus;
use crate::core::session::PeerSession;
use crate::core::signal::{self, SignalKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

// ── Bus application messages ─────────────────────────────────────────────────

/// Application-level messages carried inside the bus `dataStr`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum AppMessage {
    /// The joiner announces presence in the room.
    #[serde(rename = "join")]
    Join,
    /// An encoded offer or answer.
    #[serde(rename = "signal")]
    Signal { content: String },
}

fn to_wire(msg: &AppMessage) -> Result<String> {
    serde_json::to_string(msg).map_err(|e| EngineError::InvalidFormat(format!("bus message: {e}")))
}

/// A fresh 6-digit rendezvous code.
pub fn generate_code() -> String {
    format!("{:06}", rand::random::<u32>() % 1_000_000)
}

// ── Host (offer) side ────────────────────────────────────────────────────────

/// Publish the offer into `code`'s room and keep re-publishing until the
/// first valid answer is applied. Returns once the answer is in.
pub async fn host(
    session: &Arc<PeerSession>,
    client: &RendezvousClient,
    events: &mut mpsc::UnboundedReceiver<RendezvousEvent>,
    code: &str,
) -> Result<()> {
    let offer = session.create_offer().await?;
    client.connect(code).await?;
    info!(event = "handshake_hosting", room = code);

    let offer_msg = to_wire(&AppMessage::Signal {
        content: offer.clone(),
    })?;
    let mut resend = tokio::time::interval(RENDEZVOUS_RESEND_INTERVAL);
    let mut last_applied: Option<String> = None;

    loop {
        tokio::select! {
            _ = resend.tick() => {
                // First tick fires immediately, covering the onOpen publish.
                if let Err(e) = client.send(offer_msg.clone()).await {
                    warn!(event = "offer_publish_failed", error = %e);
                }
            }
            event = events.recv() => match event {
                None => return Err(EngineError::ChannelClosed("rendezvous events closed".into())),
                Some(RendezvousEvent::Open) => {}
                Some(RendezvousEvent::Error(_)) => {}
                Some(RendezvousEvent::Message(data)) => {
                    match serde_json::from_str::<AppMessage>(&data) {
                        Ok(AppMessage::Join) => {
                            debug!(event = "join_seen_republishing_offer");
                            if let Err(e) = client.send(offer_msg.clone()).await {
                                warn!(event = "offer_publish_failed", error = %e);
                            }
                        }
                        Ok(AppMessage::Signal { content }) => {
                            if last_applied.as_deref() == Some(content.as_str()) {
                                continue;
                            }
                            match signal::decode(&content) {
                                Ok(decoded) if decoded.kind == SignalKind::Answer => {
                                    session.apply_answer(&content).await?;
                                    last_applied = Some(content);
                                    info!(event = "answer_applied");
                                    return Ok(());
                                }
                                Ok(_) => {
                                    // Our own offer relayed back, or a third
                                    // party's; either way not an answer.
                                    debug!(event = "non_answer_signal_ignored");
                                }
                                Err(e) => {
                                    warn!(event = "undecodable_signal", error = %e);
                                }
                            }
                        }
                        Err(_) => {
                            debug!(event = "unknown_bus_message_ignored");
                        }
                    }
                }
            }
        }
    }
}

// ── Join (answer) side ───────────────────────────────────────────────────────

/// Beacon presence in `code`'s room until the first offer arrives, then
/// answer it and publish the answer.
pub async fn join(
    session: &Arc<PeerSession>,
    client: &RendezvousClient,
    events: &mut mpsc::UnboundedReceiver<RendezvousEvent>,
    code: &str,
) -> Result<()> {
    client.connect(code).await?;
    info!(event = "handshake_joining", room = code);

    let join_msg = to_wire(&AppMessage::Join)?;
    let mut beacon = tokio::time::interval(RENDEZVOUS_RESEND_INTERVAL);

    loop {
        tokio::select! {
            _ = beacon.tick() => {
                if let Err(e) = client.send(join_msg.clone()).await {
                    warn!(event = "join_publish_failed", error = %e);
                }
            }
            event = events.recv() => match event {
                None => return Err(EngineError::ChannelClosed("rendezvous events closed".into())),
                Some(RendezvousEvent::Open) => {}
                Some(RendezvousEvent::Error(_)) => {}
                Some(RendezvousEvent::Message(data)) => {
                    let Ok(AppMessage::Signal { content }) = serde_json::from_str::<AppMessage>(&data)
                    else {
                        continue;
                    };
                    match signal::decode(&content) {
                        Ok(decoded) if decoded.kind == SignalKind::Offer => {
                            let answer = session.create_answer(&content).await?;
                            client
                                .send(to_wire(&AppMessage::Signal { content: answer })?)
                                .await?;
                            info!(event = "answer_published");
                            return Ok(());
                        }
                        Ok(_) => {
                            // An answer in the room is either our own echo or
                            // cross-talk; never treat it as an offer.
                            debug!(event = "non_offer_signal_ignored");
                        }
                        Err(e) => {
                            warn!(event = "undecodable_signal", error = %e);
                        }
                    }
                }
            }
        }
    }
}

// ── Convergence ──────────────────────────────────────────────────────────────

/// Wait until the session reports `connected`, failing on terminal
/// statuses or timeout.
pub async fn wait_connected(session: &PeerSession, timeout: Duration) -> Result<()> {
    let mut status = session.subscribe_status();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        let current = *status.borrow();
        if current == SessionStatus::Connected {
            return Ok(());
        }
        if current.is_terminal() {
            return Err(EngineError::ChannelClosed(format!(
                "session ended while connecting: {current:?}"
            )));
        }
        tokio::select! {
            changed = status.changed() => {
                changed.map_err(|_| EngineError::ChannelClosed("session dropped".into()))?;
            }
            _ = &mut deadline => return Err(EngineError::Timeout("connect".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::transport::{LinkState, PeerTransport};
    use crate::core::settings::EngineConfig;
    use crate::core::testing::{test_profile, transport_pair, LocalBus};

    #[tokio::test]
    async fn host_and_join_converge_on_connected() {
        let bus = Arc::new(LocalBus::new());
        let (ta, tb) = transport_pair();
        let (sa, _ea) = PeerSession::new(
            EngineConfig::default(),
            test_profile(),
            ta.clone() as Arc<dyn PeerTransport>,
        );
        let (sb, _eb) = PeerSession::new(
            EngineConfig::default(),
            test_profile(),
            tb.clone() as Arc<dyn PeerTransport>,
        );

        let code = generate_code();

        let host_task = {
            let sa = Arc::clone(&sa);
            let (client, mut events) = RendezvousClient::new(bus.clone());
            let code = code.clone();
            tokio::spawn(async move { host(&sa, &client, &mut events, &code).await })
        };
        let join_task = {
            let sb = Arc::clone(&sb);
            let (client, mut events) = RendezvousClient::new(bus.clone());
            let code = code.clone();
            tokio::spawn(async move { join(&sb, &client, &mut events, &code).await })
        };

        join_task.await.unwrap().unwrap();
        host_task.await.unwrap().unwrap();

        // Applying the answer drives both mock links to connected.
        wait_connected(&sa, Duration::from_secs(5)).await.unwrap();
        wait_connected(&sb, Duration::from_secs(5)).await.unwrap();
        assert_eq!(ta.link_state(), LinkState::Connected);
        assert_eq!(tb.link_state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn join_ignores_answers_in_the_room() {
        // A stray answer (e.g. relayed cross-talk) must not be treated as
        // an offer; the joiner keeps waiting and picks up the real offer.
        let bus = Arc::new(LocalBus::new());
        let (ta, tb) = transport_pair();
        let (sa, _ea) = PeerSession::new(
            EngineConfig::default(),
            test_profile(),
            ta as Arc<dyn PeerTransport>,
        );
        let (sb, _eb) = PeerSession::new(
            EngineConfig::default(),
            test_profile(),
            tb as Arc<dyn PeerTransport>,
        );

        let code = generate_code();

        // A third party spams an answer signal into the room.
        let spam = {
            let (client, _events) = RendezvousClient::new(bus.clone());
            let content = crate::core::signal::encode(
                SignalKind::Answer,
                "v=0\r\nbogus\r\n",
                &EngineConfig::default(),
            )
            .unwrap();
            let code = code.clone();
            tokio::spawn(async move {
                client.connect(&code).await.unwrap();
                for _ in 0..5 {
                    let _ = client
                        .send(to_wire(&AppMessage::Signal { content: content.clone() }).unwrap())
                        .await;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            })
        };

        let join_task = {
            let sb = Arc::clone(&sb);
            let (client, mut events) = RendezvousClient::new(bus.clone());
            let code = code.clone();
            tokio::spawn(async move { join(&sb, &client, &mut events, &code).await })
        };
        let host_task = {
            let sa = Arc::clone(&sa);
            let (client, mut events) = RendezvousClient::new(bus.clone());
            let code = code.clone();
            tokio::spawn(async move { host(&sa, &client, &mut events, &code).await })
        };

        join_task.await.unwrap().unwrap();
        host_task.await.unwrap().unwrap();
        spam.await.unwrap();
    }

    #[test]
    fn codes_are_six_digits() {
        for _ in 0..64 {
            let code = generate_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn app_messages_use_the_bus_wire_shape() {
        assert_eq!(to_wire(&AppMessage::Join).unwrap(), r#"{"type":"join"}"#);
        let signal = to_wire(&AppMessage::Signal {
            content: "SHR2:ABC".into(),
        })
        .unwrap();
        assert_eq!(signal, r#"{"type":"signal","content":"SHR2:ABC"}"#);
    }
}
