//! Peer session: owns the negotiated transport, one control channel, and
//! a dynamic set of file channels.
//!
//! All protocol logic lives in the sibling sub-modules (`control`,
//! `channels`, `heartbeat`) and in `core::transfer`; this file owns the
//! shared state and the public surface.

pub mod channels;
pub mod control;
pub mod heartbeat;
pub mod transport;
pub mod types;
pub mod webrtc;

use crate::core::cancel::CancelToken;
use crate::core::config::HostProfile;
use crate::core::error::{EngineError, Result};
use crate::core::settings::EngineConfig;
use crate::core::signal::{self, sdp, SignalKind};
use crate::core::transfer::receiver::{self, IncomingTransfer};
use crate::core::transfer::sender::{self, OutgoingJob};
use crate::core::transfer::sink::{ByteSink, FileSource};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use transport::{DataChannel, LinkState, PeerTransport};
use types::{RemoteCapabilities, SessionEvent, SessionStatus};

// ── Shared state ─────────────────────────────────────────────────────────────

/// Pending one-shot waits parked on control-channel replies.
///
/// A single slot per kind suffices: the outgoing queue admits one active
/// transfer at a time. `early_accept` buffers a `file-accept` that beats
/// the sender's wait registration, scoped to the active outgoing id only.
#[derive(Default)]
pub(crate) struct Waiters {
    pub accept: Option<(String, oneshot::Sender<()>)>,
    pub early_accept: Option<String>,
    pub done: Option<(String, oneshot::Sender<()>)>,
}

/// The currently active outgoing transfer, if any.
pub(crate) struct ActiveOutgoing {
    pub id: String,
    pub sid: String,
    pub cancel: CancelToken,
    pub meta_sent: bool,
}

/// State shared between the session surface, channel handlers, and the
/// transfer pumps.
pub(crate) struct SessionShared {
    pub cfg: EngineConfig,
    pub profile: HostProfile,
    pub transport: Arc<dyn PeerTransport>,

    pub control: RwLock<Option<Arc<dyn DataChannel>>>,
    pub file_channels: RwLock<HashMap<String, Arc<dyn DataChannel>>>,

    pub status: watch::Sender<SessionStatus>,
    pub events: mpsc::UnboundedSender<SessionEvent>,

    pub remote_caps: Mutex<Option<RemoteCapabilities>>,
    pub caps_notify: Notify,

    pub last_activity: Mutex<Instant>,
    pub waiters: Mutex<Waiters>,

    /// Receive slot: at most one incoming transfer at a time.
    pub receiving: tokio::sync::Mutex<Option<IncomingTransfer>>,
    pub active_outgoing: Mutex<Option<ActiveOutgoing>>,

    /// Per-session token the stripe bases are derived from.
    pub stream_base: String,
    pub stream_counter: AtomicU64,

    pub hello_sent: AtomicBool,
    pub heartbeat_running: AtomicBool,
    pub closed: AtomicBool,
}

impl SessionShared {
    pub fn status_now(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Transition the surfaced status. Terminal statuses are sticky.
    pub fn set_status(&self, next: SessionStatus) {
        let current = self.status_now();
        if current == next || current.is_terminal() {
            return;
        }
        debug!(event = "session_status", from = ?current, to = ?next);
        let _ = self.status.send(next);
        self.emit(SessionEvent::StatusChanged(next));
    }

    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Record peer activity; a timed-out peer flips back to connected.
    pub fn mark_activity(&self) {
        *self.last_activity.lock().expect("activity lock poisoned") = Instant::now();
        if self.status_now() == SessionStatus::PeerTimeout {
            self.set_status(SessionStatus::Connected);
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("activity lock poisoned")
            .elapsed()
    }

    /// Store the remote `hello` capabilities and wake any waiter.
    pub fn store_remote_caps(&self, caps: RemoteCapabilities) {
        *self.remote_caps.lock().expect("caps lock poisoned") = Some(caps);
        self.caps_notify.notify_waiters();
    }

    pub fn remote_caps(&self) -> Option<RemoteCapabilities> {
        *self.remote_caps.lock().expect("caps lock poisoned")
    }
}

// ── Session ──────────────────────────────────────────────────────────────────

/// A peer session over a negotiated transport.
///
/// Owns its channels: closing the session closes all of them, rejects
/// every pending waiter with `ChannelClosed`, and cancels both transfer
/// directions without peer notification.
pub struct PeerSession {
    shared: Arc<SessionShared>,
    outgoing: mpsc::UnboundedSender<OutgoingJob>,
}

impl PeerSession {
    pub fn new(
        cfg: EngineConfig,
        profile: HostProfile,
        transport: Arc<dyn PeerTransport>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(SessionStatus::New);

        let shared = Arc::new(SessionShared {
            cfg,
            profile,
            transport: Arc::clone(&transport),
            control: RwLock::new(None),
            file_channels: RwLock::new(HashMap::new()),
            status,
            events,
            remote_caps: Mutex::new(None),
            caps_notify: Notify::new(),
            last_activity: Mutex::new(Instant::now()),
            waiters: Mutex::new(Waiters::default()),
            receiving: tokio::sync::Mutex::new(None),
            active_outgoing: Mutex::new(None),
            stream_base: format!("{:08x}", rand::random::<u32>()),
            stream_counter: AtomicU64::new(0),
            hello_sent: AtomicBool::new(false),
            heartbeat_running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        // Inbound channels are dispatched by label; unknown labels bind
        // as control while no control channel exists yet.
        {
            let shared = Arc::clone(&shared);
            transport.set_on_channel(Box::new(move |ch| {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    channels::route_inbound(shared, ch).await;
                });
            }));
        }
        {
            let shared = Arc::clone(&shared);
            transport.set_on_state_change(Box::new(move |state| {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    handle_link_state(shared, state).await;
                });
            }));
        }

        let outgoing = sender::spawn_outgoing_worker(Arc::clone(&shared));
        (Arc::new(Self { shared, outgoing }), events_rx)
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status_now()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status.subscribe()
    }

    // ── Negotiation ──────────────────────────────────────────────────────

    /// Build the local offer: opens the control channel, gathers
    /// candidates, applies the LAN override, and encodes the signal.
    pub async fn create_offer(&self) -> Result<String> {
        self.shared.set_status(SessionStatus::Connecting);
        let control = self
            .shared
            .transport
            .create_channel(crate::core::config::CONTROL_CHANNEL_LABEL, true)
            .await?;
        channels::bind_control(&self.shared, control).await;

        let local = self.shared.transport.create_offer().await?;
        let local = sdp::rewrite_host_candidates(&local, self.shared.cfg.lan_host_override);
        signal::encode(SignalKind::Offer, &local, &self.shared.cfg)
    }

    /// Decode a remote offer, mirror the construction, and return the
    /// encoded answer.
    pub async fn create_answer(&self, offer: &str) -> Result<String> {
        let decoded = signal::decode(offer)?;
        if decoded.kind != SignalKind::Offer {
            return Err(EngineError::ProtocolViolation(
                "expected an offer signal".into(),
            ));
        }
        self.shared.set_status(SessionStatus::Connecting);

        let local = self
            .shared
            .transport
            .create_answer(&decoded.description)
            .await?;
        let local = sdp::rewrite_host_candidates(&local, self.shared.cfg.lan_host_override);
        signal::encode(SignalKind::Answer, &local, &self.shared.cfg)
    }

    pub async fn apply_answer(&self, answer: &str) -> Result<()> {
        let decoded = signal::decode(answer)?;
        if decoded.kind != SignalKind::Answer {
            return Err(EngineError::ProtocolViolation(
                "expected an answer signal".into(),
            ));
        }
        self.shared.transport.apply_answer(&decoded.description).await
    }

    // ── Channels & capabilities ──────────────────────────────────────────

    /// Open `count` file channels for `base`. Idempotent per stream id.
    pub async fn ensure_file_channels(
        &self,
        base: &str,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<Arc<dyn DataChannel>>> {
        channels::ensure_file_channels(&self.shared, base, count, timeout).await
    }

    /// Close every file channel whose id is `base` or starts with `base:`.
    pub async fn close_file_channels_by_prefix(&self, base: &str) {
        channels::close_file_channels_by_prefix(&self.shared, base).await;
    }

    /// Resolve when `channel`'s buffered amount has drained to `low` or
    /// the channel leaves `open`; errors on cancel or timeout.
    pub async fn wait_for_buffer(
        &self,
        channel: &Arc<dyn DataChannel>,
        low: usize,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<()> {
        crate::core::transfer::backpressure::wait_for_buffer(channel, low, timeout, cancel).await
    }

    /// Resolve once the remote `hello` has been seen; `None` on timeout.
    pub async fn wait_for_remote_capabilities(
        &self,
        timeout: Duration,
    ) -> Option<RemoteCapabilities> {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            let notified = self.shared.caps_notify.notified();
            if let Some(caps) = self.shared.remote_caps() {
                return Some(caps);
            }
            tokio::select! {
                _ = notified => {}
                _ = &mut deadline => return None,
            }
        }
    }

    // ── Messaging ────────────────────────────────────────────────────────

    /// Send a text message on the control channel.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        control::send_control(
            &self.shared,
            &types::ControlMessage::Text { text: text.into() },
        )
        .await
    }

    // ── File transfer ────────────────────────────────────────────────────

    /// Queue a file send and wait for it to finish. Jobs run strictly one
    /// at a time in enqueue order. Returns the transfer id.
    pub async fn send_file(
        &self,
        source: Arc<dyn FileSource>,
        cancel: CancelToken,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.send_file_as(id.clone(), source, cancel).await?;
        Ok(id)
    }

    /// [`PeerSession::send_file`] with a caller-chosen transfer id.
    pub async fn send_file_as(
        &self,
        id: String,
        source: Arc<dyn FileSource>,
        cancel: CancelToken,
    ) -> Result<()> {
        let (done, done_rx) = oneshot::channel();
        self.outgoing
            .send(OutgoingJob {
                id,
                source,
                cancel,
                done,
            })
            .map_err(|_| EngineError::ChannelClosed("outgoing queue stopped".into()))?;
        done_rx
            .await
            .map_err(|_| EngineError::ChannelClosed("outgoing queue stopped".into()))?
    }

    /// Accept the incoming transfer `id`, streaming into `sink` when one
    /// is supplied and into memory otherwise.
    pub async fn accept_incoming(&self, id: &str, sink: Option<Box<dyn ByteSink>>) -> Result<()> {
        receiver::accept(&self.shared, id, sink).await
    }

    /// Cancel the incoming transfer `id`, notifying the peer. Idempotent.
    pub async fn cancel_incoming(&self, id: &str, reason: &str) {
        receiver::cancel_local(&self.shared, Some(id), reason, true).await;
    }

    // ── Teardown ─────────────────────────────────────────────────────────

    pub async fn close(&self) {
        teardown(&self.shared, SessionStatus::Closed).await;
        self.shared.transport.close().await;
    }
}

// ── Link state & teardown ────────────────────────────────────────────────────

async fn handle_link_state(shared: Arc<SessionShared>, state: LinkState) {
    match state {
        LinkState::Connected => {
            info!(event = "link_connected");
            shared.mark_activity();
            shared.set_status(SessionStatus::Connected);
        }
        LinkState::Connecting | LinkState::New => {
            shared.set_status(SessionStatus::Connecting);
        }
        LinkState::Disconnected => {
            warn!(event = "link_disconnected");
            teardown(&shared, SessionStatus::Disconnected).await;
        }
        LinkState::Failed => {
            warn!(event = "link_failed");
            teardown(&shared, SessionStatus::Failed).await;
        }
        LinkState::Closed => {
            teardown(&shared, SessionStatus::Closed).await;
        }
    }
}

/// Session termination: reject every pending waiter, cancel both transfer
/// directions without peer notification, close every channel.
pub(crate) async fn teardown(shared: &Arc<SessionShared>, status: SessionStatus) {
    if shared.closed.swap(true, Ordering::SeqCst) {
        return;
    }
    let _ = shared.status.send(status);
    shared.emit(SessionEvent::StatusChanged(status));

    // Dropping the waiter senders fails the waits with ChannelClosed.
    {
        let mut waiters = shared.waiters.lock().expect("waiters lock poisoned");
        waiters.accept = None;
        waiters.early_accept = None;
        waiters.done = None;
    }

    if let Some(active) = shared
        .active_outgoing
        .lock()
        .expect("outgoing lock poisoned")
        .take()
    {
        active
            .cancel
            .abort(EngineError::ChannelClosed("session terminated".into()));
    }

    receiver::cancel_local(shared, None, "session terminated", false).await;

    let channels: Vec<_> = shared.file_channels.write().await.drain().collect();
    for (_, ch) in channels {
        ch.close().await;
    }
    if let Some(control) = shared.control.write().await.take() {
        control.close().await;
    }
}
