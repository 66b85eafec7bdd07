//! Receiver side of the file-transfer state machine.
//!
//! `file-meta` allocates the single receive slot; the embedder accepts
//! with a sink (or none, for the in-memory fallback); frames arriving on
//! any stripe of the transfer's base are resequenced by seq and committed
//! in order. Commits go through a write queue flushed in batches by a
//! self-chaining task so at most one sink write is in flight while frames
//! keep landing.

use crate::core::config::{ACCEPT_RESEND_INTERVAL, ACCEPT_RESEND_MAX, WRITE_QUEUE_COMPACT_MIN};
use crate::core::error::{EngineError, Result};
use crate::core::session::control::send_control;
use crate::core::session::types::{ControlMessage, SessionEvent};
use crate::core::session::SessionShared;
use crate::core::transfer::frame::decode_frame;
use crate::core::transfer::sink::ByteSink;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

// ── Write queue ──────────────────────────────────────────────────────────────

/// FIFO of committed-but-unflushed buffers. Consumption advances a head
/// index; the backing storage is compacted once the consumed prefix
/// exceeds both [`WRITE_QUEUE_COMPACT_MIN`] items and half the queue.
#[derive(Default)]
pub(crate) struct WriteQueue {
    items: Vec<Bytes>,
    head: usize,
    queued_bytes: usize,
}

impl WriteQueue {
    pub fn push(&mut self, data: Bytes) {
        self.queued_bytes += data.len();
        self.items.push(data);
    }

    pub fn is_empty(&self) -> bool {
        self.head >= self.items.len()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Take the next batch, up to `target` bytes (always at least one
    /// item when non-empty).
    pub fn next_batch(&mut self, target: usize) -> Vec<Bytes> {
        let mut batch = Vec::new();
        let mut taken = 0usize;
        while self.head < self.items.len() {
            let len = self.items[self.head].len();
            if !batch.is_empty() && taken + len > target {
                break;
            }
            batch.push(self.items[self.head].clone());
            self.head += 1;
            taken += len;
        }
        self.queued_bytes -= taken;
        self.maybe_compact();
        batch
    }

    fn maybe_compact(&mut self) {
        if self.head > WRITE_QUEUE_COMPACT_MIN && self.head > self.items.len() / 2 {
            self.items.drain(..self.head);
            self.head = 0;
        }
    }

    #[cfg(test)]
    fn backing_len(&self) -> usize {
        self.items.len()
    }
}

// ── Incoming transfer state ──────────────────────────────────────────────────

/// Live state for the single in-progress incoming transfer.
pub(crate) struct IncomingTransfer {
    pub id: String,
    pub stream_base: String,
    pub stream_count: u32,
    pub name: String,
    pub size: u64,
    pub received: u64,
    pub expected_seq: u32,
    pub pending: HashMap<u32, Bytes>,
    pub sink: Option<Box<dyn ByteSink>>,
    /// In-memory chunks when no sink was supplied.
    pub fallback: Vec<Bytes>,
    pub queue: WriteQueue,
    pub accepted: bool,
    pub accept_acked: Arc<AtomicBool>,
    /// All bytes committed; finalization pending (flush, close, done).
    pub complete: bool,
    pub flush_in_flight: bool,
}

impl IncomingTransfer {
    fn new(id: String, stream_base: String, stream_count: u32, name: String, size: u64) -> Self {
        Self {
            id,
            stream_base,
            stream_count,
            name,
            size,
            received: 0,
            expected_seq: 0,
            pending: HashMap::new(),
            sink: None,
            fallback: Vec::new(),
            queue: WriteQueue::default(),
            accepted: false,
            accept_acked: Arc::new(AtomicBool::new(false)),
            complete: false,
            flush_in_flight: false,
        }
    }
}

// ── Protocol entry points ────────────────────────────────────────────────────

/// `file-meta`: allocate the receive slot. A meta arriving while a
/// receive is in progress is ignored.
pub(crate) async fn on_file_meta(
    shared: &Arc<SessionShared>,
    id: String,
    sid: String,
    sc: u32,
    name: String,
    size: u64,
) {
    let mut slot = shared.receiving.lock().await;
    if let Some(existing) = slot.as_ref() {
        warn!(
            event = "file_meta_ignored",
            id = %id,
            busy_with = %existing.id,
            "Receive slot occupied; ignoring file-meta"
        );
        return;
    }
    info!(event = "incoming_file", %id, name = %name, size, stripes = sc);
    *slot = Some(IncomingTransfer::new(id.clone(), sid, sc, name.clone(), size));
    drop(slot);

    shared.emit(SessionEvent::IncomingFile { id, name, size });
}

/// User accepted: attach the sink, emit `file-accept`, and keep
/// re-emitting until the ack lands. Idempotent per transfer.
pub(crate) async fn accept(
    shared: &Arc<SessionShared>,
    id: &str,
    sink: Option<Box<dyn ByteSink>>,
) -> Result<()> {
    let acked = {
        let mut slot = shared.receiving.lock().await;
        let transfer = slot
            .as_mut()
            .filter(|t| t.id == id)
            .ok_or_else(|| EngineError::ProtocolViolation(format!("no incoming transfer '{id}'")))?;
        if transfer.accepted {
            return Ok(());
        }
        transfer.accepted = true;
        transfer.sink = sink;
        Arc::clone(&transfer.accept_acked)
    };

    send_control(
        shared,
        &ControlMessage::FileAccept { id: id.to_string() },
    )
    .await?;

    // Resend until acked; the first transmission counts as attempt 1.
    let shared = Arc::clone(shared);
    let id = id.to_string();
    tokio::spawn(async move {
        for _ in 1..ACCEPT_RESEND_MAX {
            tokio::time::sleep(ACCEPT_RESEND_INTERVAL).await;
            if acked.load(Ordering::SeqCst) {
                return;
            }
            let still_active = shared
                .receiving
                .lock()
                .await
                .as_ref()
                .is_some_and(|t| t.id == id);
            if !still_active {
                return;
            }
            debug!(event = "accept_resend", %id);
            if send_control(&shared, &ControlMessage::FileAccept { id: id.clone() })
                .await
                .is_err()
            {
                return;
            }
        }
        warn!(event = "accept_resend_exhausted", %id);
    });
    Ok(())
}

pub(crate) async fn on_accept_ack(shared: &Arc<SessionShared>, id: &str) {
    let slot = shared.receiving.lock().await;
    if let Some(transfer) = slot.as_ref().filter(|t| t.id == id) {
        transfer.accept_acked.store(true, Ordering::SeqCst);
    }
}

/// An inbound frame on file channel `stream_id`.
pub(crate) async fn handle_frame(shared: &Arc<SessionShared>, stream_id: &str, data: Bytes) {
    shared.mark_activity();

    let frame = match decode_frame(&data) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(event = "bad_frame", %stream_id, error = %e);
            return;
        }
    };
    let base = stream_id.split(':').next().unwrap_or(stream_id);

    let mut slot = shared.receiving.lock().await;
    let Some(transfer) = slot.as_mut().filter(|t| t.stream_base == base) else {
        debug!(event = "frame_without_transfer", %stream_id, seq = frame.seq);
        return;
    };
    if !transfer.accepted {
        warn!(event = "frame_before_accept", %stream_id, seq = frame.seq);
        return;
    }

    match frame.seq.cmp(&transfer.expected_seq) {
        std::cmp::Ordering::Less => {
            debug!(event = "duplicate_frame_dropped", seq = frame.seq);
            return;
        }
        std::cmp::Ordering::Greater => {
            transfer.pending.insert(frame.seq, frame.payload);
            return;
        }
        std::cmp::Ordering::Equal => {
            commit(transfer, frame.payload);
            while let Some(next) = transfer.pending.remove(&transfer.expected_seq) {
                commit(transfer, next);
            }
        }
    }

    shared.emit(SessionEvent::ReceiveProgress {
        id: transfer.id.clone(),
        received: transfer.received,
        total: transfer.size,
    });

    if transfer.received >= transfer.size {
        transfer.complete = true;
    }

    let has_sink = transfer.sink.is_some();
    let complete = transfer.complete;
    if has_sink {
        if !transfer.queue.is_empty() || complete {
            schedule_flush(shared, transfer);
        }
        return;
    }
    if complete {
        let transfer = slot.take().expect("slot checked");
        drop(slot);
        finalize_in_memory(shared, transfer).await;
    }
}

/// Advance the in-order cursor and stage the payload.
fn commit(transfer: &mut IncomingTransfer, payload: Bytes) {
    transfer.expected_seq += 1;
    transfer.received += payload.len() as u64;
    if transfer.sink.is_some() {
        transfer.queue.push(payload);
    } else {
        transfer.fallback.push(payload);
    }
}

// ── Flushing & finalization ──────────────────────────────────────────────────

/// Spawn the flusher unless one is already chained.
fn schedule_flush(shared: &Arc<SessionShared>, transfer: &mut IncomingTransfer) {
    if transfer.flush_in_flight {
        return;
    }
    transfer.flush_in_flight = true;
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        flush_loop(shared).await;
    });
}

/// Drain the write queue in batches. The sink is taken out of the slot
/// for the duration of each write so inbound frames keep queueing; the
/// loop finalizes once the queue is dry and the transfer is complete.
async fn flush_loop(shared: Arc<SessionShared>) {
    loop {
        let mut slot = shared.receiving.lock().await;
        let (queue_empty, complete) = match slot.as_ref() {
            // Cancelled while a flush was pending.
            None => return,
            Some(transfer) => (transfer.queue.is_empty(), transfer.complete),
        };

        if queue_empty {
            if !complete {
                slot.as_mut().expect("slot checked").flush_in_flight = false;
                return;
            }
            let mut transfer = slot.take().expect("slot checked");
            drop(slot);
            let sink = transfer.sink.take();
            finalize_with_sink(&shared, transfer, sink).await;
            return;
        }

        let target = shared.profile.write_batch_target(shared.cfg.fast_mode);
        let (batch, sink, id) = {
            let transfer = slot.as_mut().expect("slot checked");
            let batch = transfer.queue.next_batch(target);
            let sink = transfer.sink.take();
            (batch, sink, transfer.id.clone())
        };
        let Some(mut sink) = sink else {
            // Sink lost to a concurrent cancel.
            slot.as_mut().expect("slot checked").flush_in_flight = false;
            return;
        };
        drop(slot);

        let mut write_error = None;
        for buf in batch {
            if let Err(e) = sink.write(buf).await {
                write_error = Some(e);
                break;
            }
        }

        let mut slot = shared.receiving.lock().await;
        let still_ours = slot.as_ref().is_some_and(|t| t.id == id);
        if !still_ours {
            // Transfer vanished while writing: discard the partial output.
            drop(slot);
            let _ = sink.abort().await;
            return;
        }
        if let Some(e) = write_error {
            let transfer = slot.take().expect("slot checked");
            drop(slot);
            warn!(event = "sink_write_failed", %id, error = %e);
            let _ = sink.abort().await;
            let _ = send_control(
                &shared,
                &ControlMessage::FileCancel {
                    id: transfer.id.clone(),
                    reason: "sink error".into(),
                },
            )
            .await;
            shared.emit(SessionEvent::ReceiveCancelled {
                id: transfer.id,
                reason: e.to_string(),
            });
            return;
        }
        slot.as_mut().expect("slot checked").sink = Some(sink);
    }
}

async fn finalize_with_sink(
    shared: &Arc<SessionShared>,
    transfer: IncomingTransfer,
    sink: Option<Box<dyn ByteSink>>,
) {
    if let Some(mut sink) = sink {
        if let Err(e) = sink.close().await {
            warn!(event = "sink_close_failed", id = %transfer.id, error = %e);
            let _ = send_control(
                shared,
                &ControlMessage::FileCancel {
                    id: transfer.id.clone(),
                    reason: "sink error".into(),
                },
            )
            .await;
            shared.emit(SessionEvent::ReceiveCancelled {
                id: transfer.id,
                reason: e.to_string(),
            });
            return;
        }
    }
    announce_done(shared, &transfer.id, transfer.received).await;
    shared.emit(SessionEvent::ReceiveComplete {
        id: transfer.id,
        data: None,
    });
}

async fn finalize_in_memory(shared: &Arc<SessionShared>, transfer: IncomingTransfer) {
    let mut assembled = BytesMut::with_capacity(transfer.received as usize);
    for chunk in &transfer.fallback {
        assembled.extend_from_slice(chunk);
    }
    announce_done(shared, &transfer.id, transfer.received).await;
    shared.emit(SessionEvent::ReceiveComplete {
        id: transfer.id,
        data: Some(assembled.freeze()),
    });
}

async fn announce_done(shared: &Arc<SessionShared>, id: &str, received: u64) {
    info!(event = "receive_complete", %id, bytes = received);
    if let Err(e) = send_control(shared, &ControlMessage::FileDone { id: id.to_string() }).await {
        warn!(event = "file_done_send_failed", %id, error = %e);
    }
}

// ── Cancellation ─────────────────────────────────────────────────────────────

/// Cancel the incoming transfer, aborting its sink and clearing all
/// buffers. `id = None` cancels whatever occupies the slot. Idempotent:
/// a second cancel finds the slot empty and does nothing.
pub(crate) async fn cancel_local(
    shared: &Arc<SessionShared>,
    id: Option<&str>,
    reason: &str,
    notify_peer: bool,
) {
    let transfer = {
        let mut slot = shared.receiving.lock().await;
        let matches = match (slot.as_ref(), id) {
            (Some(current), Some(wanted)) => current.id == wanted,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            return;
        }
        slot.take()
    };
    let Some(mut transfer) = transfer else { return };

    info!(event = "receive_cancelled", id = %transfer.id, %reason, notify_peer);
    transfer.pending.clear();

    if let Some(mut sink) = transfer.sink.take() {
        if let Err(e) = sink.abort().await {
            warn!(event = "sink_abort_failed", id = %transfer.id, error = %e);
        }
    }

    if notify_peer {
        let _ = send_control(
            shared,
            &ControlMessage::FileCancel {
                id: transfer.id.clone(),
                reason: reason.to_string(),
            },
        )
        .await;
    }

    shared.emit(SessionEvent::ReceiveCancelled {
        id: transfer.id,
        reason: reason.to_string(),
    });
}

/// Peer-initiated cancel: tear down locally without echoing a cancel.
pub(crate) async fn on_peer_cancel(shared: &Arc<SessionShared>, id: &str, reason: &str) {
    cancel_local(shared, Some(id), reason, false).await;
}

/// A closing stripe-base channel mid-transfer cancels the receive
/// locally, without peer notification.
pub(crate) async fn on_file_channel_closed(shared: &Arc<SessionShared>, stream_id: &str) {
    let matches = shared
        .receiving
        .lock()
        .await
        .as_ref()
        .is_some_and(|t| t.stream_base == stream_id);
    if matches {
        warn!(event = "stripe_base_closed_mid_transfer", %stream_id);
        cancel_local(shared, None, "file channel closed", false).await;
    }
}
