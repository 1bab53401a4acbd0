use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

/// A message waiting for its peer
#[derive(Debug, Clone)]
pub struct Queued {
    pub text: Arc<str>,
    pub queued_at: Instant,
}

impl Queued {
    pub fn is_stale(&self, now: Instant, stale_after: Duration) -> bool {
        now.saturating_duration_since(self.queued_at) > stale_after
    }
}

/// Per-peer FIFO that never hands out messages older than `stale_after`
#[derive(Debug)]
pub struct PeerQueue {
    items: VecDeque<Queued>,
    stale_after: Duration,
    dropped: u64,
}

impl PeerQueue {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            items: VecDeque::new(),
            stale_after,
            dropped: 0,
        }
    }

    pub fn push(&mut self, text: Arc<str>, now: Instant) {
        self.items.push_back(Queued { text, queued_at: now });
    }

    /// Put back a message that could not be handed on.
    pub fn requeue(&mut self, item: Queued) {
        self.items.push_front(item);
    }

    /// Oldest message that is still fresh. Stale ones on the way are dropped.
    pub fn pop_fresh(&mut self, now: Instant) -> Option<Queued> {
        while let Some(item) = self.items.pop_front() {
            if !item.is_stale(now, self.stale_after) {
                return Some(item);
            }
            self.dropped += 1;
        }
        None
    }

    /// Discard everything, returning how many messages were lost.
    pub fn clear(&mut self) -> usize {
        let lost = self.items.len();
        self.dropped += lost as u64;
        self.items.clear();
        lost
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Messages discarded so far, stale or cleared
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
