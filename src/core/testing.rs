//! Test support: an in-memory transport pair, a loopback signal bus, and
//! deterministic host profiles.
//!
//! The mock transport mirrors the behaviours the engine depends on:
//! channels created on one side surface on the other with the same
//! label, sends deliver synchronously (or are held for reorder tests),
//! sends can be primed to fail, and buffered amounts are scriptable.

use crate::core::config::HostProfile;
use crate::core::error::{EngineError, Result};
use crate::core::rendezvous::SignalBus;
use crate::core::session::transport::{
    ChannelHandler, ChannelState, DataChannel, EventHandler, LinkState, LinkStateHandler,
    MessageHandler, PeerTransport,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{broadcast, mpsc};

/// A profile with fixed tiers so tests never depend on the build host.
pub fn test_profile() -> HostProfile {
    HostProfile {
        memory_bytes: None,
        concurrency: 8,
    }
}

/// Two connected sessions over a mock transport pair: the offerer's
/// control channel is open on both sides and both hellos have flowed.
pub async fn session_pair(
    cfg_a: crate::core::settings::EngineConfig,
    cfg_b: crate::core::settings::EngineConfig,
) -> (
    Arc<crate::core::session::PeerSession>,
    mpsc::UnboundedReceiver<crate::core::session::types::SessionEvent>,
    Arc<MockTransport>,
    Arc<crate::core::session::PeerSession>,
    mpsc::UnboundedReceiver<crate::core::session::types::SessionEvent>,
    Arc<MockTransport>,
) {
    use crate::core::session::PeerSession;

    let (ta, tb) = transport_pair();
    let (sa, ea) = PeerSession::new(cfg_a, test_profile(), ta.clone() as Arc<dyn PeerTransport>);
    let (sb, eb) = PeerSession::new(cfg_b, test_profile(), tb.clone() as Arc<dyn PeerTransport>);

    sa.create_offer().await.expect("mock offer");
    ta.set_link_state(LinkState::Connected);
    tb.set_link_state(LinkState::Connected);

    // Let the control consumers run so both hellos land.
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    (sa, ea, ta, sb, eb, tb)
}

// ── Loopback bus ─────────────────────────────────────────────────────────────

/// In-memory broadcast bus: every subscriber of a room sees every
/// published payload, its own included, like the real bus.
pub struct LocalBus {
    rooms: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
        }
    }

    fn room(&self, room: &str) -> broadcast::Sender<String> {
        self.rooms
            .lock()
            .expect("bus lock poisoned")
            .entry(room.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalBus for LocalBus {
    async fn subscribe(&self, room: &str) -> Result<mpsc::UnboundedReceiver<String>> {
        let mut source = self.room(room).subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok(payload) = source.recv().await {
                if tx.send(payload).is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn publish(&self, room: &str, payload: String) -> Result<()> {
        // A broadcast with no subscribers is lost, as on the real bus.
        let _ = self.room(room).send(payload);
        Ok(())
    }

    async fn unsubscribe(&self, _room: &str) {}
}

// ── Mock channel ─────────────────────────────────────────────────────────────

type Handlers = (
    Mutex<Option<MessageHandler>>,
    Mutex<Option<EventHandler>>,
    Mutex<Option<EventHandler>>,
);

pub struct MockChannel {
    label: String,
    state: Mutex<ChannelState>,
    peer: Mutex<Option<Weak<MockChannel>>>,
    handlers: Handlers,
    /// Frames delivered before a message handler was attached.
    inbox: Mutex<Vec<Bytes>>,
    buffered: AtomicUsize,
    fail_queue: Mutex<VecDeque<EngineError>>,
    hold: AtomicBool,
    held: Mutex<Vec<Bytes>>,
    sent: Mutex<Vec<Bytes>>,
}

impl MockChannel {
    fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            state: Mutex::new(ChannelState::Open),
            peer: Mutex::new(None),
            handlers: (Mutex::new(None), Mutex::new(None), Mutex::new(None)),
            inbox: Mutex::new(Vec::new()),
            buffered: AtomicUsize::new(0),
            fail_queue: Mutex::new(VecDeque::new()),
            hold: AtomicBool::new(false),
            held: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn peer(&self) -> Option<Arc<MockChannel>> {
        self.peer
            .lock()
            .expect("mock lock poisoned")
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Deliver a frame to this end, as if it arrived from the network.
    pub fn inject(&self, data: Bytes) {
        let handler = self.handlers.0.lock().expect("mock lock poisoned");
        match handler.as_ref() {
            Some(h) => h(data),
            None => self.inbox.lock().expect("mock lock poisoned").push(data),
        }
    }

    /// Prime the next send to fail with `err`.
    pub fn fail_next_send(&self, err: EngineError) {
        self.fail_queue
            .lock()
            .expect("mock lock poisoned")
            .push_back(err);
    }

    /// While held, sends are recorded instead of delivered.
    pub fn set_hold(&self, hold: bool) {
        self.hold.store(hold, Ordering::SeqCst);
    }

    /// Drain the held frames (in send order).
    pub fn take_held(&self) -> Vec<Bytes> {
        std::mem::take(&mut *self.held.lock().expect("mock lock poisoned"))
    }

    pub fn set_buffered(&self, n: usize) {
        self.buffered.store(n, Ordering::SeqCst);
    }

    /// Everything sent on this end, accepted or held.
    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().expect("mock lock poisoned").clone()
    }

    fn fire_close(&self) {
        *self.state.lock().expect("mock lock poisoned") = ChannelState::Closed;
        if let Some(h) = self.handlers.2.lock().expect("mock lock poisoned").as_ref() {
            h();
        }
    }
}

#[async_trait]
impl DataChannel for MockChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> ChannelState {
        *self.state.lock().expect("mock lock poisoned")
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        if self.state() != ChannelState::Open {
            return Err(EngineError::ChannelClosed(self.label.clone()));
        }
        if let Some(err) = self
            .fail_queue
            .lock()
            .expect("mock lock poisoned")
            .pop_front()
        {
            return Err(err);
        }
        self.sent
            .lock()
            .expect("mock lock poisoned")
            .push(data.clone());

        if self.hold.load(Ordering::SeqCst) {
            self.held.lock().expect("mock lock poisoned").push(data);
            return Ok(());
        }
        if let Some(peer) = self.peer() {
            peer.inject(data);
        }
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn max_message_size(&self) -> Option<usize> {
        None
    }

    fn set_on_message(&self, handler: MessageHandler) {
        let backlog = {
            let mut slot = self.handlers.0.lock().expect("mock lock poisoned");
            *slot = Some(handler);
            std::mem::take(&mut *self.inbox.lock().expect("mock lock poisoned"))
        };
        if !backlog.is_empty() {
            let slot = self.handlers.0.lock().expect("mock lock poisoned");
            if let Some(h) = slot.as_ref() {
                for data in backlog {
                    h(data);
                }
            }
        }
    }

    fn set_on_open(&self, handler: EventHandler) {
        *self.handlers.1.lock().expect("mock lock poisoned") = Some(handler);
    }

    fn set_on_close(&self, handler: EventHandler) {
        *self.handlers.2.lock().expect("mock lock poisoned") = Some(handler);
    }

    async fn close(&self) {
        if self.state() == ChannelState::Closed {
            return;
        }
        self.fire_close();
        if let Some(peer) = self.peer() {
            if peer.state() != ChannelState::Closed {
                peer.fire_close();
            }
        }
    }
}

// ── Mock transport pair ──────────────────────────────────────────────────────

pub struct MockTransport {
    peer: Mutex<Option<Weak<MockTransport>>>,
    on_channel: Mutex<Option<ChannelHandler>>,
    on_state: Mutex<Option<LinkStateHandler>>,
    state: Mutex<LinkState>,
    channels: Mutex<Vec<Arc<MockChannel>>>,
    pending_inbound: Mutex<Vec<Arc<MockChannel>>>,
    hold_prefix: Mutex<Option<String>>,
    fail_first: Mutex<Option<(String, EngineError)>>,
}

/// Two linked transports: channels created on one side surface on the
/// other, already open.
pub fn transport_pair() -> (Arc<MockTransport>, Arc<MockTransport>) {
    let a = MockTransport::new();
    let b = MockTransport::new();
    *a.peer.lock().expect("mock lock poisoned") = Some(Arc::downgrade(&b));
    *b.peer.lock().expect("mock lock poisoned") = Some(Arc::downgrade(&a));
    (a, b)
}

impl MockTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            peer: Mutex::new(None),
            on_channel: Mutex::new(None),
            on_state: Mutex::new(None),
            state: Mutex::new(LinkState::New),
            channels: Mutex::new(Vec::new()),
            pending_inbound: Mutex::new(Vec::new()),
            hold_prefix: Mutex::new(None),
            fail_first: Mutex::new(None),
        })
    }

    fn peer(&self) -> Option<Arc<MockTransport>> {
        self.peer
            .lock()
            .expect("mock lock poisoned")
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Locally created channels whose label starts with `prefix` are
    /// created held (sends recorded, not delivered).
    pub fn hold_channels_with_prefix(&self, prefix: &str) {
        *self.hold_prefix.lock().expect("mock lock poisoned") = Some(prefix.to_string());
    }

    /// Prime the next channel created under `prefix` to refuse its first
    /// send with `err`.
    pub fn fail_first_send_with_prefix(&self, prefix: &str, err: EngineError) {
        *self.fail_first.lock().expect("mock lock poisoned") = Some((prefix.to_string(), err));
    }

    /// All channel endpoints seen by this side, creation order.
    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        self.channels.lock().expect("mock lock poisoned").clone()
    }

    pub fn channel(&self, label: &str) -> Option<Arc<MockChannel>> {
        self.channels()
            .into_iter()
            .find(|c| c.label() == label)
    }

    /// Drive the link state, firing the session's handler.
    pub fn set_link_state(&self, state: LinkState) {
        *self.state.lock().expect("mock lock poisoned") = state;
        if let Some(h) = self.on_state.lock().expect("mock lock poisoned").as_ref() {
            h(state);
        }
    }

    fn accept_inbound(&self, ch: Arc<MockChannel>) {
        self.channels
            .lock()
            .expect("mock lock poisoned")
            .push(Arc::clone(&ch));
        let handler = self.on_channel.lock().expect("mock lock poisoned");
        match handler.as_ref() {
            Some(h) => h(ch),
            None => self
                .pending_inbound
                .lock()
                .expect("mock lock poisoned")
                .push(ch),
        }
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_channel(&self, label: &str, _ordered: bool) -> Result<Arc<dyn DataChannel>> {
        let local = MockChannel::new(label);
        let remote = MockChannel::new(label);
        *local.peer.lock().expect("mock lock poisoned") = Some(Arc::downgrade(&remote));
        *remote.peer.lock().expect("mock lock poisoned") = Some(Arc::downgrade(&local));

        let held = self
            .hold_prefix
            .lock()
            .expect("mock lock poisoned")
            .as_ref()
            .is_some_and(|p| label.starts_with(p.as_str()));
        if held {
            local.set_hold(true);
        }
        {
            let mut fail = self.fail_first.lock().expect("mock lock poisoned");
            if fail.as_ref().is_some_and(|(p, _)| label.starts_with(p.as_str())) {
                let (_, err) = fail.take().expect("checked above");
                local.fail_next_send(err);
            }
        }

        self.channels
            .lock()
            .expect("mock lock poisoned")
            .push(Arc::clone(&local));
        if let Some(peer) = self.peer() {
            peer.accept_inbound(remote);
        }
        Ok(local)
    }

    fn set_on_channel(&self, handler: ChannelHandler) {
        let backlog = {
            let mut slot = self.on_channel.lock().expect("mock lock poisoned");
            *slot = Some(handler);
            std::mem::take(
                &mut *self
                    .pending_inbound
                    .lock()
                    .expect("mock lock poisoned"),
            )
        };
        if !backlog.is_empty() {
            let slot = self.on_channel.lock().expect("mock lock poisoned");
            if let Some(h) = slot.as_ref() {
                for ch in backlog {
                    h(ch);
                }
            }
        }
    }

    fn set_on_state_change(&self, handler: LinkStateHandler) {
        *self.on_state.lock().expect("mock lock poisoned") = Some(handler);
    }

    fn link_state(&self) -> LinkState {
        *self.state.lock().expect("mock lock poisoned")
    }

    async fn create_offer(&self) -> Result<String> {
        Ok("v=0\r\nmock-offer\r\n".to_string())
    }

    async fn create_answer(&self, _remote_offer: &str) -> Result<String> {
        self.set_link_state(LinkState::Connected);
        Ok("v=0\r\nmock-answer\r\n".to_string())
    }

    async fn apply_answer(&self, _remote_answer: &str) -> Result<()> {
        self.set_link_state(LinkState::Connected);
        Ok(())
    }

    async fn close(&self) {
        self.set_link_state(LinkState::Closed);
    }
}
