//! Channel lifecycle and inbound routing.
//!
//! Dispatch is by label: `sharefile-ctrl` binds as the control channel,
//! `sharefile-file:<stream-id>` binds as a file channel, and an unknown
//! label binds as control only while no control channel exists. Every
//! bound channel gets a per-channel in-order queue with a single
//! consumer task, so inbound handling never reorders within a channel.

use super::transport::{ChannelState, DataChannel};
use super::{control, heartbeat, SessionShared};
use crate::core::config::{BUFFER_POLL_INTERVAL, CONTROL_CHANNEL_LABEL, FILE_CHANNEL_PREFIX};
use crate::core::error::{EngineError, Result};
use crate::core::transfer::receiver;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

// ── Inbound routing ──────────────────────────────────────────────────────────

pub(crate) async fn route_inbound(shared: Arc<SessionShared>, ch: Arc<dyn DataChannel>) {
    let label = ch.label().to_string();
    if label == CONTROL_CHANNEL_LABEL {
        bind_control(&shared, ch).await;
    } else if let Some(stream_id) = label.strip_prefix(FILE_CHANNEL_PREFIX) {
        bind_file_channel(&shared, stream_id.to_string(), ch).await;
    } else if shared.control.read().await.is_none() {
        debug!(event = "unlabelled_channel_as_control", %label);
        bind_control(&shared, ch).await;
    } else {
        warn!(event = "unknown_channel_ignored", %label);
    }
}

/// Bind the control channel: wire its consumer, send `hello` and start
/// the heartbeat once it opens.
pub(crate) async fn bind_control(shared: &Arc<SessionShared>, ch: Arc<dyn DataChannel>) {
    *shared.control.write().await = Some(Arc::clone(&ch));

    // In-order queue with a single consumer.
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    ch.set_on_message(Box::new(move |data| {
        let _ = tx.send(data);
    }));
    {
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                control::handle_control_payload(&shared, data).await;
            }
        });
    }

    {
        let shared = Arc::clone(shared);
        ch.set_on_open(Box::new(move || {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                on_control_open(shared).await;
            });
        }));
    }
    {
        let shared = Arc::clone(shared);
        ch.set_on_close(Box::new(move || {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                warn!(event = "control_channel_closed");
                super::teardown(&shared, super::types::SessionStatus::Disconnected).await;
            });
        }));
    }

    // The channel may have opened before the handler was registered.
    if ch.state() == ChannelState::Open {
        on_control_open(Arc::clone(shared)).await;
    }
}

async fn on_control_open(shared: Arc<SessionShared>) {
    control::send_hello(&shared).await;
    heartbeat::start(&shared);
}

/// Bind an inbound file channel under its stream id.
pub(crate) async fn bind_file_channel(
    shared: &Arc<SessionShared>,
    stream_id: String,
    ch: Arc<dyn DataChannel>,
) {
    debug!(event = "file_channel_bound", stream_id = %stream_id);

    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    ch.set_on_message(Box::new(move |data| {
        let _ = tx.send(data);
    }));
    {
        let shared = Arc::clone(shared);
        let stream_id = stream_id.clone();
        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                receiver::handle_frame(&shared, &stream_id, data).await;
            }
        });
    }
    {
        let shared = Arc::clone(shared);
        let stream_id = stream_id.clone();
        ch.set_on_close(Box::new(move || {
            let shared = Arc::clone(&shared);
            let stream_id = stream_id.clone();
            tokio::spawn(async move {
                receiver::on_file_channel_closed(&shared, &stream_id).await;
            });
        }));
    }

    shared
        .file_channels
        .write()
        .await
        .insert(stream_id, ch);
}

// ── Outbound file channels ───────────────────────────────────────────────────

/// Stream id of stripe `k` for `base`.
fn stripe_id(base: &str, k: usize) -> String {
    if k == 0 {
        base.to_string()
    } else {
        format!("{base}:{k}")
    }
}

/// Open `count` stripes for `base`, reusing channels that already exist.
/// Returns the channels in stripe order once all of them are open.
pub(crate) async fn ensure_file_channels(
    shared: &Arc<SessionShared>,
    base: &str,
    count: usize,
    timeout: Duration,
) -> Result<Vec<Arc<dyn DataChannel>>> {
    let ordered = !shared.cfg.use_unordered_file_channels;
    let mut out = Vec::with_capacity(count);

    for k in 0..count {
        let id = stripe_id(base, k);
        let existing = shared.file_channels.read().await.get(&id).cloned();
        let ch = match existing {
            Some(ch) if ch.state() != ChannelState::Closed => ch,
            _ => {
                let label = format!("{FILE_CHANNEL_PREFIX}{id}");
                let ch = shared.transport.create_channel(&label, ordered).await?;
                shared
                    .file_channels
                    .write()
                    .await
                    .insert(id.clone(), Arc::clone(&ch));
                ch
            }
        };
        out.push(ch);
    }

    for ch in &out {
        wait_channel_open(ch, timeout).await?;
    }
    Ok(out)
}

/// Close every file channel whose id is exactly `base` or begins with
/// `base:`.
pub(crate) async fn close_file_channels_by_prefix(shared: &Arc<SessionShared>, base: &str) {
    let stripe_prefix = format!("{base}:");
    let victims: Vec<_> = {
        let mut map = shared.file_channels.write().await;
        let keys: Vec<String> = map
            .keys()
            .filter(|k| *k == base || k.starts_with(&stripe_prefix))
            .cloned()
            .collect();
        keys.into_iter().filter_map(|k| map.remove(&k)).collect()
    };
    for ch in victims {
        ch.close().await;
    }
}

/// Poll until the channel opens, fails permanently, or the timeout
/// expires.
async fn wait_channel_open(ch: &Arc<dyn DataChannel>, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match ch.state() {
            ChannelState::Open => return Ok(()),
            ChannelState::Closed | ChannelState::Closing => {
                return Err(EngineError::ChannelClosed(ch.label().to_string()));
            }
            ChannelState::Connecting => {
                if tokio::time::Instant::now() >= deadline {
                    return Err(EngineError::Timeout(format!(
                        "channel '{}' did not open",
                        ch.label()
                    )));
                }
                tokio::time::sleep(BUFFER_POLL_INTERVAL).await;
            }
        }
    }
}
