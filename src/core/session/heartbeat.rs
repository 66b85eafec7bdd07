//! Heartbeat and peer-timeout machine.
//!
//! Once the control channel opens, a ping goes out every tick. Peer
//! activity is marked on every inbound frame (control or file); when the
//! activity window lapses the status flips to `PeerTimeout`, and the next
//! inbound frame flips it back. Pings continue through a timeout so the
//! other side can recover too.

use super::types::{ControlMessage, SessionStatus};
use super::{control, SessionShared};
use crate::core::config::{HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Start the heartbeat task. Idempotent per session.
pub(crate) fn start(shared: &Arc<SessionShared>) {
    if shared.heartbeat_running.swap(true, Ordering::SeqCst) {
        return;
    }
    debug!(event = "heartbeat_started");

    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so pings are spaced.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if shared.closed.load(Ordering::SeqCst) || shared.status_now().is_terminal() {
                break;
            }

            let ping = ControlMessage::HbPing { t: now_millis() };
            if let Err(e) = control::send_control(&shared, &ping).await {
                debug!(event = "ping_send_failed", error = %e);
            }

            if shared.idle_for() >= HEARTBEAT_TIMEOUT
                && shared.status_now() == SessionStatus::Connected
            {
                warn!(
                    event = "peer_timeout",
                    idle_ms = shared.idle_for().as_millis() as u64
                );
                shared.set_status(SessionStatus::PeerTimeout);
            }
        }
        debug!(event = "heartbeat_stopped");
    });
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
