use std::time::Duration;

use tokio::time::Instant;

/// Throttles editor renders while chunks keep arriving.
///
/// The batcher only counts and times; the session owns the buffer and always
/// renders all of it, so a render can lag behind but never show stale text.
#[derive(Debug, Clone)]
pub struct RenderBatcher {
    batch_size: usize,
    interval: Duration,
    pending: usize,
    last_render: Option<Instant>,
}

impl RenderBatcher {
    pub fn new(batch_size: usize, interval: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            interval,
            pending: 0,
            last_render: None,
        }
    }

    /// Registers one chunk. Returns `true` when a render is due now.
    pub fn push(&mut self, now: Instant) -> bool {
        self.pending += 1;
        self.pending >= self.batch_size
            || self
                .last_render
                .is_none_or(|last| now.duration_since(last) >= self.interval)
    }

    pub fn has_pending(&self) -> bool {
        self.pending > 0
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    /// When the pending chunks must be rendered even if no more arrive.
    pub fn deadline(&self) -> Option<Instant> {
        if self.pending == 0 {
            return None;
        }
        self.last_render.map(|last| last + self.interval)
    }

    pub fn mark_rendered(&mut self, now: Instant) {
        self.pending = 0;
        self.last_render = Some(now);
    }

    pub fn reset(&mut self) {
        self.pending = 0;
        self.last_render = None;
    }
}
