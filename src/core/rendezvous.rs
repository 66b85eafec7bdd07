//! Rendezvous client: a thin adapter over the broadcast bus used to
//! exchange signals.
//!
//! The client never parses signal content. It wraps outbound payloads in
//! the `{senderId, dataStr}` bus envelope, drops inbound frames that
//! carry its own sender id, and surfaces everything else as events.
//! Bus failures are debounced so a flapping link does not flood the
//! embedder with identical reports.

use crate::core::config::RENDEZVOUS_ERROR_DEBOUNCE;
use crate::core::error::{EngineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

// ── Bus contract ─────────────────────────────────────────────────────────────

/// The pub/sub broadcast bus. One topic per rendezvous room; every
/// subscriber sees every published payload, including its own.
#[async_trait]
pub trait SignalBus: Send + Sync {
    /// Subscribe to a room. The receiver yields raw payload strings.
    async fn subscribe(&self, room: &str) -> Result<mpsc::UnboundedReceiver<String>>;

    /// Broadcast a payload. Resolves only once the bus acknowledges.
    async fn publish(&self, room: &str, payload: String) -> Result<()>;

    async fn unsubscribe(&self, room: &str);
}

#[derive(Serialize, Deserialize)]
struct BusEnvelope {
    #[serde(rename = "senderId")]
    sender_id: String,
    #[serde(rename = "dataStr")]
    data_str: String,
}

// ── Client ───────────────────────────────────────────────────────────────────

/// Events surfaced to the handshake layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RendezvousEvent {
    /// Subscription confirmed. Emitted once per `connect`.
    Open,
    /// A remote payload (the inner `dataStr`), self-echo already removed.
    Message(String),
    /// A bus failure, debounced per identical message.
    Error(String),
}

struct Active {
    room: String,
    pump: JoinHandle<()>,
}

/// Rendezvous room client with self-echo suppression.
pub struct RendezvousClient {
    bus: Arc<dyn SignalBus>,
    client_id: String,
    events: mpsc::UnboundedSender<RendezvousEvent>,
    active: Mutex<Option<Active>>,
    last_error: Arc<Mutex<Option<(String, Instant)>>>,
}

impl RendezvousClient {
    pub fn new(bus: Arc<dyn SignalBus>) -> (Self, mpsc::UnboundedReceiver<RendezvousEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let client = Self {
            bus,
            client_id: format!("{:016x}", rand::random::<u64>()),
            events,
            active: Mutex::new(None),
            last_error: Arc::new(Mutex::new(None)),
        };
        (client, events_rx)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Join a room. Emits [`RendezvousEvent::Open`] once the subscription
    /// is confirmed; any previous room is left first.
    pub async fn connect(&self, room: &str) -> Result<()> {
        self.disconnect().await;

        let mut rx = self.bus.subscribe(room).await?;
        let _ = self.events.send(RendezvousEvent::Open);
        debug!(event = "rendezvous_joined", room, client_id = %self.client_id);

        let events = self.events.clone();
        let own_id = self.client_id.clone();
        let last_error = Arc::clone(&self.last_error);
        let pump = tokio::spawn(async move {
            while let Some(raw) = rx.recv().await {
                match serde_json::from_str::<BusEnvelope>(&raw) {
                    Ok(envelope) => {
                        if envelope.sender_id == own_id {
                            continue;
                        }
                        let _ = events.send(RendezvousEvent::Message(envelope.data_str));
                    }
                    Err(e) => {
                        report_error(
                            &events,
                            &last_error,
                            format!("malformed bus frame: {e}"),
                        );
                    }
                }
            }
        });

        *self.active.lock().expect("rendezvous lock poisoned") = Some(Active {
            room: room.to_string(),
            pump,
        });
        Ok(())
    }

    /// Broadcast a payload to the current room.
    pub async fn send(&self, data_str: String) -> Result<()> {
        let room = {
            let active = self.active.lock().expect("rendezvous lock poisoned");
            active
                .as_ref()
                .map(|a| a.room.clone())
                .ok_or(EngineError::NotConnected)?
        };

        let envelope = BusEnvelope {
            sender_id: self.client_id.clone(),
            data_str,
        };
        let payload = serde_json::to_string(&envelope)
            .map_err(|e| EngineError::InvalidFormat(format!("bus envelope: {e}")))?;

        self.bus.publish(&room, payload).await.map_err(|e| {
            report_error(&self.events, &self.last_error, e.to_string());
            e
        })
    }

    /// Leave the room. Idempotent.
    pub async fn disconnect(&self) {
        let previous = self.active.lock().expect("rendezvous lock poisoned").take();
        if let Some(active) = previous {
            active.pump.abort();
            self.bus.unsubscribe(&active.room).await;
            debug!(event = "rendezvous_left", room = %active.room);
        }
    }
}

/// Emit an error event unless the identical message fired within the
/// debounce window.
fn report_error(
    events: &mpsc::UnboundedSender<RendezvousEvent>,
    last_error: &Arc<Mutex<Option<(String, Instant)>>>,
    message: String,
) {
    let now = Instant::now();
    {
        let mut guard = last_error.lock().expect("rendezvous lock poisoned");
        if let Some((prev, at)) = guard.as_ref() {
            if *prev == message && now.duration_since(*at) < RENDEZVOUS_ERROR_DEBOUNCE {
                return;
            }
        }
        *guard = Some((message.clone(), now));
    }
    warn!(event = "rendezvous_error", %message);
    let _ = events.send(RendezvousEvent::Error(message));
}
