//! Inbound control dispatch and control-channel sends.
//!
//! Every message marks peer activity before anything else so the timeout
//! machine sees traffic even when the payload is garbage. A payload that
//! fails JSON parsing is delivered upstream verbatim as text.

use super::transport::ChannelState;
use super::types::{
    CapabilityFlags, ControlMessage, RemoteCapabilities, SessionEvent, PROTOCOL_VERSION,
};
use super::SessionShared;
use crate::core::error::{EngineError, Result};
use crate::core::transfer::receiver;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

// ── Sending ──────────────────────────────────────────────────────────────────

/// Send a control message iff the control channel is open.
pub(crate) async fn send_control(shared: &Arc<SessionShared>, msg: &ControlMessage) -> Result<()> {
    let control = shared
        .control
        .read()
        .await
        .clone()
        .ok_or(EngineError::NotConnected)?;
    if control.state() != ChannelState::Open {
        return Err(EngineError::NotConnected);
    }
    let json = serde_json::to_string(msg)
        .map_err(|e| EngineError::InvalidFormat(format!("control encode: {e}")))?;
    control.send(Bytes::from(json)).await
}

/// First message on control open: advertise our protocol version and
/// striping capability. Sent at most once per session.
pub(crate) async fn send_hello(shared: &Arc<SessionShared>) {
    if shared
        .hello_sent
        .swap(true, std::sync::atomic::Ordering::SeqCst)
    {
        return;
    }
    let hello = ControlMessage::Hello {
        v: PROTOCOL_VERSION,
        caps: CapabilityFlags {
            striping: shared.cfg.use_striping as u8,
        },
    };
    if let Err(e) = send_control(shared, &hello).await {
        warn!(event = "hello_send_failed", error = %e);
    }
}

// ── Receiving ────────────────────────────────────────────────────────────────

pub(crate) async fn handle_control_payload(shared: &Arc<SessionShared>, data: Bytes) {
    shared.mark_activity();

    let raw = String::from_utf8_lossy(&data).into_owned();
    let msg = match serde_json::from_str::<ControlMessage>(&raw) {
        Ok(msg) => msg,
        Err(_) => {
            // Plain strings on the control channel surface as text.
            shared.emit(SessionEvent::TextReceived(raw));
            return;
        }
    };

    match msg {
        ControlMessage::Hello { v, caps } => {
            debug!(event = "hello_received", version = v, striping = caps.striping);
            shared.store_remote_caps(RemoteCapabilities {
                version: v,
                striping: caps.striping != 0,
            });
        }

        ControlMessage::HbPing { t } => {
            // Echo so the other side's liveness window refreshes.
            if let Err(e) = send_control(shared, &ControlMessage::HbPong { t }).await {
                debug!(event = "pong_send_failed", error = %e);
            }
        }

        ControlMessage::HbPong { .. } => {}

        ControlMessage::Text { text } => {
            shared.emit(SessionEvent::TextReceived(text));
        }

        ControlMessage::FileMeta {
            id,
            sid,
            sc,
            name,
            size,
        } => {
            receiver::on_file_meta(shared, id, sid, sc, name, size).await;
        }

        ControlMessage::FileAccept { id } => {
            on_file_accept(shared, id);
        }

        ControlMessage::FileAcceptAck { id } => {
            receiver::on_accept_ack(shared, &id).await;
        }

        ControlMessage::FileDone { id } => {
            on_file_done(shared, id);
        }

        ControlMessage::FileCancel { id, reason } => {
            on_file_cancel(shared, id, reason).await;
        }
    }
}

/// Resolve the sender's accept wait, or buffer an early accept for the
/// active outgoing id.
fn on_file_accept(shared: &Arc<SessionShared>, id: String) {
    let mut waiters = shared.waiters.lock().expect("waiters lock poisoned");
    if waiters
        .accept
        .as_ref()
        .is_some_and(|(waiting, _)| *waiting == id)
    {
        let (_, tx) = waiters.accept.take().expect("checked above");
        let _ = tx.send(());
        return;
    }

    let is_active = shared
        .active_outgoing
        .lock()
        .expect("outgoing lock poisoned")
        .as_ref()
        .is_some_and(|active| active.id == id);
    if is_active {
        debug!(event = "early_accept_buffered", %id);
        waiters.early_accept = Some(id);
    } else {
        warn!(event = "stray_file_accept", %id);
    }
}

fn on_file_done(shared: &Arc<SessionShared>, id: String) {
    let mut waiters = shared.waiters.lock().expect("waiters lock poisoned");
    if waiters
        .done
        .as_ref()
        .is_some_and(|(waiting, _)| *waiting == id)
    {
        let (_, tx) = waiters.done.take().expect("checked above");
        let _ = tx.send(());
    } else {
        debug!(event = "stray_file_done", %id);
    }
}

/// A peer cancel aborts whichever direction carries the id.
async fn on_file_cancel(shared: &Arc<SessionShared>, id: String, reason: String) {
    let outgoing_hit = shared
        .active_outgoing
        .lock()
        .expect("outgoing lock poisoned")
        .as_ref()
        .filter(|active| active.id == id)
        .map(|active| active.cancel.clone());
    if let Some(cancel) = outgoing_hit {
        warn!(event = "outgoing_cancelled_by_peer", %id, %reason);
        cancel.abort(EngineError::PeerCancelled(reason.clone()));
    }

    receiver::on_peer_cancel(shared, &id, &reason).await;
}
