//! Outbound flow control.
//!
//! Each stripe channel carries a bounded send buffer. The pump keeps
//! `buffered_amount` under a high watermark sized by the host profile;
//! when the transport still rejects a frame with a queue-full error, the
//! watermark halves (floored at 1 MiB) and the channel is drained to a
//! fixed target before the same frame is retransmitted.

use crate::core::cancel::CancelToken;
use crate::core::config::{BUFFER_POLL_INTERVAL, QUEUE_FULL_DRAIN_TARGET, WATERMARK_FLOOR};
use crate::core::error::{EngineError, Result};
use crate::core::session::transport::{ChannelState, DataChannel};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

// ── Watermarks ───────────────────────────────────────────────────────────────

/// Adaptive high/low watermark pair. `low` is always derived from `high`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub high: usize,
    pub low: usize,
}

impl Watermarks {
    pub fn new(high: usize) -> Self {
        Self {
            high,
            low: low_for(high),
        }
    }

    /// Queue-full response: halve the high watermark, floor 1 MiB.
    pub fn shrink(&mut self) {
        self.high = (self.high / 2).max(WATERMARK_FLOOR);
        self.low = low_for(self.high);
    }
}

fn low_for(high: usize) -> usize {
    WATERMARK_FLOOR.max(high / 4)
}

// ── Waits ────────────────────────────────────────────────────────────────────

/// Resolve when `buffered_amount <= low` or the channel leaves `Open`
/// (the subsequent send reports the closure). Errors on cancel or when
/// the timeout lapses.
pub async fn wait_for_buffer(
    ch: &Arc<dyn DataChannel>,
    low: usize,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if ch.state() != ChannelState::Open {
            return Ok(());
        }
        if ch.buffered_amount().await <= low {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(EngineError::Timeout(format!(
                "buffer drain on '{}'",
                ch.label()
            )));
        }
        tokio::select! {
            _ = tokio::time::sleep(BUFFER_POLL_INTERVAL) => {}
            _ = cancel.cancelled() => return Err(cancel.error()),
        }
    }
}

/// Resolve when any channel's buffer is below `high`; used between pump
/// budgets when every stripe is saturated.
pub(crate) async fn wait_any_below_high(
    channels: &[Arc<dyn DataChannel>],
    high: usize,
    cancel: &CancelToken,
) -> Result<()> {
    loop {
        let mut any_open = false;
        for ch in channels {
            if ch.state() != ChannelState::Open {
                continue;
            }
            any_open = true;
            if ch.buffered_amount().await < high {
                return Ok(());
            }
        }
        if !any_open {
            return Err(EngineError::ChannelClosed("all stripes closed".into()));
        }
        tokio::select! {
            _ = tokio::time::sleep(BUFFER_POLL_INTERVAL) => {}
            _ = cancel.cancelled() => return Err(cancel.error()),
        }
    }
}

/// Send one frame, adapting the watermarks on queue-full rejections and
/// retransmitting the identical frame after the drain.
pub(crate) async fn send_frame_adaptive(
    ch: &Arc<dyn DataChannel>,
    frame: bytes::Bytes,
    marks: &mut Watermarks,
    cancel: &CancelToken,
) -> Result<()> {
    loop {
        if ch.state() != ChannelState::Open {
            return Err(EngineError::ChannelClosed(ch.label().to_string()));
        }
        match ch.send(frame.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_queue_full() => {
                marks.shrink();
                info!(
                    event = "queue_full_adapted",
                    channel = %ch.label(),
                    high = marks.high,
                    low = marks.low,
                    "Send queue rejected a frame; watermarks shrunk, draining"
                );
                drain_to(ch, QUEUE_FULL_DRAIN_TARGET, cancel).await?;
            }
            Err(e) => {
                warn!(event = "send_failed", channel = %ch.label(), error = %e);
                return Err(e);
            }
        }
    }
}

async fn drain_to(ch: &Arc<dyn DataChannel>, target: usize, cancel: &CancelToken) -> Result<()> {
    loop {
        if ch.state() != ChannelState::Open {
            return Err(EngineError::ChannelClosed(ch.label().to_string()));
        }
        if ch.buffered_amount().await <= target {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(BUFFER_POLL_INTERVAL) => {}
            _ = cancel.cancelled() => return Err(cancel.error()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CHUNK_SIZE_TARGET;
    use crate::core::testing::transport_pair;
    use crate::core::session::transport::PeerTransport;

    const MIB: usize = 1024 * 1024;

    #[test]
    fn low_is_quarter_of_high_with_floor() {
        let marks = Watermarks::new(16 * MIB);
        assert_eq!(marks.low, 4 * MIB);
        let marks = Watermarks::new(2 * MIB);
        assert_eq!(marks.low, MIB);
    }

    #[test]
    fn shrink_halves_and_floors() {
        let mut marks = Watermarks::new(16 * MIB);
        let mut previous = marks.high;
        // Repeated queue-full events converge on the floor and the new
        // high always stays within [1 MiB, previous/2 + chunk].
        for _ in 0..8 {
            marks.shrink();
            assert!(marks.high >= MIB);
            assert!(marks.high <= previous / 2 + CHUNK_SIZE_TARGET);
            assert_eq!(marks.low, WATERMARK_FLOOR.max(marks.high / 4));
            previous = marks.high;
        }
        assert_eq!(marks.high, MIB);
        assert_eq!(marks.low, MIB);
    }

    #[tokio::test(start_paused = true)]
    async fn buffer_wait_times_out_resolves_and_cancels() {
        let (ta, _tb) = transport_pair();
        let ch = ta.create_channel("sharefile-file:w", true).await.unwrap();
        let mock = ta.channel("sharefile-file:w").unwrap();
        let cancel = CancelToken::new();

        mock.set_buffered(10 * MIB);
        let err = wait_for_buffer(&ch, MIB, Duration::from_millis(200), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));

        mock.set_buffered(MIB / 2);
        wait_for_buffer(&ch, MIB, Duration::from_secs(1), &cancel)
            .await
            .unwrap();

        mock.set_buffered(10 * MIB);
        cancel.cancel();
        assert_eq!(
            wait_for_buffer(&ch, MIB, Duration::from_secs(1), &cancel)
                .await
                .unwrap_err(),
            EngineError::Cancelled
        );
    }
}
