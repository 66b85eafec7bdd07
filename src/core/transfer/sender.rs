//! Sender side of the file-transfer state machine.
//!
//! An unbounded FIFO queue feeds a single worker, so one outgoing
//! transfer is active at a time and chunk sequences of different files
//! never interleave. Each job runs meta → accept → striped pump →
//! (optional) done-wait; any failure before completion fires the job's
//! cancel token, notifies the peer iff `file-meta` went out, and closes
//! the stripe channels.

use crate::core::cancel::CancelToken;
use crate::core::config::{
    ACCEPT_TIMEOUT, CHUNK_SIZE_TARGET, DONE_TIMEOUT, FILE_CHANNEL_OPEN_TIMEOUT,
    FRAME_HEADER_BYTES, SEND_BUDGET, SEND_BUDGET_FAST,
};
use crate::core::error::{EngineError, Result};
use crate::core::session::channels;
use crate::core::session::control::send_control;
use crate::core::session::transport::{ChannelState, DataChannel};
use crate::core::session::types::{ControlMessage, SessionEvent};
use crate::core::session::{ActiveOutgoing, SessionShared};
use crate::core::transfer::backpressure::{self, Watermarks};
use crate::core::transfer::frame::encode_frame;
use crate::core::transfer::sink::FileSource;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

// ── Outgoing queue ───────────────────────────────────────────────────────────

/// One queued send job.
pub(crate) struct OutgoingJob {
    pub id: String,
    pub source: Arc<dyn FileSource>,
    pub cancel: CancelToken,
    pub done: oneshot::Sender<Result<()>>,
}

/// Spawn the queue worker. Jobs run strictly one at a time, in order.
pub(crate) fn spawn_outgoing_worker(
    shared: Arc<SessionShared>,
) -> mpsc::UnboundedSender<OutgoingJob> {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutgoingJob>();
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let result = run_send(&shared, &job).await;
            finish_job(&shared, &job, &result).await;
            let _ = job.done.send(result);
        }
    });
    tx
}

/// Post-job cleanup: fire the cancel on failure, notify the peer iff
/// meta went out (and the peer did not cancel first), close the stripes.
async fn finish_job(shared: &Arc<SessionShared>, job: &OutgoingJob, result: &Result<()>) {
    let state = shared
        .active_outgoing
        .lock()
        .expect("outgoing lock poisoned")
        .take();
    {
        let mut waiters = shared.waiters.lock().expect("waiters lock poisoned");
        waiters.accept = None;
        waiters.early_accept = None;
        waiters.done = None;
    }

    let Err(e) = result else { return };
    if !job.cancel.aborted() {
        job.cancel.abort(e.clone());
    }

    if let Some(state) = state {
        let peer_initiated = matches!(e, EngineError::PeerCancelled(_));
        if state.meta_sent && !peer_initiated {
            let _ = send_control(
                shared,
                &ControlMessage::FileCancel {
                    id: job.id.clone(),
                    reason: e.to_string(),
                },
            )
            .await;
        }
        channels::close_file_channels_by_prefix(shared, &state.sid).await;
    }
}

// ── The send state machine ───────────────────────────────────────────────────

async fn run_send(shared: &Arc<SessionShared>, job: &OutgoingJob) -> Result<()> {
    if job.cancel.aborted() {
        return Err(job.cancel.error());
    }
    let control_open = shared
        .control
        .read()
        .await
        .as_ref()
        .is_some_and(|c| c.state() == ChannelState::Open);
    if !control_open {
        return Err(EngineError::NotConnected);
    }

    // Striping requires both a local switch and a remote advertisement.
    let remote_striping = shared.remote_caps().map(|c| c.striping).unwrap_or(false);
    let stripes = if shared.cfg.use_striping && remote_striping {
        shared.profile.stripe_count()
    } else {
        1
    };

    let sid = format!(
        "{}-{}",
        shared.stream_base,
        shared.stream_counter.fetch_add(1, Ordering::SeqCst)
    );

    // Registered before file-meta goes out so an accept racing the wait
    // registration is buffered for this id.
    *shared
        .active_outgoing
        .lock()
        .expect("outgoing lock poisoned") = Some(ActiveOutgoing {
        id: job.id.clone(),
        sid: sid.clone(),
        cancel: job.cancel.clone(),
        meta_sent: false,
    });

    let stripe_channels =
        channels::ensure_file_channels(shared, &sid, stripes, FILE_CHANNEL_OPEN_TIMEOUT).await?;

    info!(
        event = "file_send_start",
        id = %job.id,
        name = job.source.name(),
        size = job.source.size(),
        stripes,
    );

    send_control(
        shared,
        &ControlMessage::FileMeta {
            id: job.id.clone(),
            sid: sid.clone(),
            sc: stripes as u32,
            name: job.source.name().to_string(),
            size: job.source.size(),
        },
    )
    .await?;
    if let Some(active) = shared
        .active_outgoing
        .lock()
        .expect("outgoing lock poisoned")
        .as_mut()
    {
        active.meta_sent = true;
    }

    // In unordered mode the receiver's file-done can outrun the pump's
    // completion, so the waiter parks before any chunk is sent.
    let done_rx = if shared.cfg.use_unordered_file_channels {
        Some(register_done_waiter(shared, &job.id))
    } else {
        None
    };

    wait_for_accept(shared, &job.id, &job.cancel).await?;
    send_control(
        shared,
        &ControlMessage::FileAcceptAck { id: job.id.clone() },
    )
    .await?;

    pump_chunks(shared, &stripe_channels, job).await?;

    if let Some(done_rx) = done_rx {
        wait_for_done(done_rx, &job.cancel).await?;
    }

    info!(event = "file_send_complete", id = %job.id);
    Ok(())
}

/// Wait for `file-accept`, honouring an early accept buffered for this
/// id between the meta send and this registration.
pub(crate) async fn wait_for_accept(
    shared: &Arc<SessionShared>,
    id: &str,
    cancel: &CancelToken,
) -> Result<()> {
    let rx = {
        let mut waiters = shared.waiters.lock().expect("waiters lock poisoned");
        if waiters.early_accept.as_deref() == Some(id) {
            debug!(event = "early_accept_consumed", %id);
            waiters.early_accept = None;
            None
        } else {
            let (tx, rx) = oneshot::channel();
            waiters.accept = Some((id.to_string(), tx));
            Some(rx)
        }
    };

    let Some(rx) = rx else { return Ok(()) };
    let outcome = tokio::select! {
        r = rx => r.map_err(|_| EngineError::ChannelClosed("session closed during accept wait".into())),
        _ = cancel.cancelled() => Err(cancel.error()),
        _ = tokio::time::sleep(ACCEPT_TIMEOUT) => Err(EngineError::Timeout("file-accept".into())),
    };
    if outcome.is_err() {
        let mut waiters = shared.waiters.lock().expect("waiters lock poisoned");
        if waiters.accept.as_ref().is_some_and(|(w, _)| w == id) {
            waiters.accept = None;
        }
    }
    outcome
}

fn register_done_waiter(shared: &Arc<SessionShared>, id: &str) -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    shared.waiters.lock().expect("waiters lock poisoned").done = Some((id.to_string(), tx));
    rx
}

async fn wait_for_done(rx: oneshot::Receiver<()>, cancel: &CancelToken) -> Result<()> {
    tokio::select! {
        r = rx => r.map_err(|_| EngineError::ChannelClosed("session closed during done wait".into())),
        _ = cancel.cancelled() => Err(cancel.error()),
        _ = tokio::time::sleep(DONE_TIMEOUT) => Err(EngineError::Timeout("file-done".into())),
    }
}

// ── Chunk pump ───────────────────────────────────────────────────────────────

/// Push chunks across the stripes inside cooperative time budgets,
/// honouring per-channel watermarks and adapting them on queue-full.
async fn pump_chunks(
    shared: &Arc<SessionShared>,
    stripe_channels: &[Arc<dyn DataChannel>],
    job: &OutgoingJob,
) -> Result<()> {
    let size = job.source.size();
    let mut marks = Watermarks::new(shared.profile.high_watermark());
    let chunk_size = chunk_size_for(stripe_channels);
    let budget = if shared.cfg.fast_mode {
        SEND_BUDGET_FAST
    } else {
        SEND_BUDGET
    };

    // An empty file still announces itself with one zero-length frame.
    if size == 0 {
        let frame = encode_frame(0, &[]);
        backpressure::send_frame_adaptive(&stripe_channels[0], frame, &mut marks, &job.cancel)
            .await?;
        shared.emit(SessionEvent::SendProgress {
            id: job.id.clone(),
            sent: 0,
            total: 0,
        });
        return Ok(());
    }

    let mut seq: u32 = 0;
    let mut offset: u64 = 0;
    let mut cursor = 0usize;

    while offset < size {
        let window = tokio::time::Instant::now();
        while offset < size && window.elapsed() < budget {
            if job.cancel.aborted() {
                return Err(job.cancel.error());
            }
            let Some(ch) = pick_stripe(stripe_channels, &mut cursor, marks.high).await else {
                break;
            };

            let end = (offset + chunk_size as u64).min(size);
            let payload = job.source.read_at(offset, (end - offset) as usize).await?;
            let frame = encode_frame(seq, &payload);
            backpressure::send_frame_adaptive(&ch, frame, &mut marks, &job.cancel).await?;
            seq = seq.wrapping_add(1);
            offset = end;
        }

        shared.emit(SessionEvent::SendProgress {
            id: job.id.clone(),
            sent: offset,
            total: size,
        });

        if offset >= size {
            break;
        }
        // Budget exhausted or all stripes saturated: yield, then block
        // until some stripe has headroom again.
        tokio::task::yield_now().await;
        backpressure::wait_any_below_high(stripe_channels, marks.high, &job.cancel).await?;
    }

    debug!(event = "pump_drained", id = %job.id, frames = seq);
    Ok(())
}

/// Round-robin over open stripes with buffer headroom.
async fn pick_stripe(
    stripe_channels: &[Arc<dyn DataChannel>],
    cursor: &mut usize,
    high: usize,
) -> Option<Arc<dyn DataChannel>> {
    for _ in 0..stripe_channels.len() {
        let ch = &stripe_channels[*cursor % stripe_channels.len()];
        *cursor = cursor.wrapping_add(1);
        if ch.state() == ChannelState::Open && ch.buffered_amount().await < high {
            return Some(Arc::clone(ch));
        }
    }
    None
}

/// Chunk size: the 256 KiB target, clamped below the transport's maximum
/// message size minus the frame header when a bound is exposed.
fn chunk_size_for(stripe_channels: &[Arc<dyn DataChannel>]) -> usize {
    match stripe_channels
        .iter()
        .filter_map(|c| c.max_message_size())
        .min()
    {
        Some(max) => CHUNK_SIZE_TARGET
            .min(max)
            .saturating_sub(FRAME_HEADER_BYTES)
            .max(1),
        None => CHUNK_SIZE_TARGET,
    }
}
