//! Cross-thread flow counters shared by the capture worker, the transport
//! paths and the quality controller.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

/// Frames emitted but not yet acknowledged or dropped
pub struct FlowCounters {
    base: Instant,
    pending: AtomicU32,
    /// Milliseconds since `base` of the last ack
    last_ack_ms: AtomicU64,
}

impl FlowCounters {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    /// Counters whose ack clock starts at `now`
    pub fn starting_at(now: Instant) -> Self {
        Self {
            base: now,
            pending: AtomicU32::new(0),
            last_ack_ms: AtomicU64::new(0),
        }
    }

    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn frame_emitted(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// One frame left the pipeline (acked or dropped)
    pub fn frame_settled(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(1)));
    }

    pub fn mark_ack(&self, now: Instant) {
        let ms = now.saturating_duration_since(self.base).as_millis() as u64;
        self.last_ack_ms.store(ms, Ordering::Release);
    }

    /// Milliseconds since the last ack, or since creation if none
    pub fn millis_since_ack(&self, now: Instant) -> u64 {
        let now_ms = now.saturating_duration_since(self.base).as_millis() as u64;
        now_ms.saturating_sub(self.last_ack_ms.load(Ordering::Acquire))
    }

    /// Clear pending frames and restart the ack clock, used on path switches
    pub fn reset(&self, now: Instant) {
        self.pending.store(0, Ordering::Release);
        self.mark_ack(now);
    }
}

impl Default for FlowCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pending_never_underflows() {
        let flow = FlowCounters::new();
        flow.frame_settled();
        assert_eq!(flow.pending(), 0);
        flow.frame_emitted();
        flow.frame_emitted();
        flow.frame_settled();
        assert_eq!(flow.pending(), 1);
    }

    #[test]
    fn ack_clock_tracks_elapsed_time() {
        let start = Instant::now();
        let flow = FlowCounters::starting_at(start);
        assert_eq!(flow.millis_since_ack(start + Duration::from_millis(700)), 700);
        flow.mark_ack(start + Duration::from_millis(1000));
        assert_eq!(flow.millis_since_ack(start + Duration::from_millis(1250)), 250);
    }

    #[test]
    fn reset_clears_pending() {
        let start = Instant::now();
        let flow = FlowCounters::starting_at(start);
        flow.frame_emitted();
        flow.reset(start + Duration::from_secs(4));
        assert_eq!(flow.pending(), 0);
        assert_eq!(flow.millis_since_ack(start + Duration::from_secs(4)), 0);
    }
}
