use std::collections::VecDeque;

/// Timestamps of the most recent color changes of a log record, newest first.
///
/// Holds at most `capacity` entries (the configured flap count). Once full,
/// pushing a new timestamp evicts the oldest one. A record is flapping when
/// the ring is full and its oldest entry lies within the flap threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlapRing {
    stamps: VecDeque<i64>,
    capacity: usize,
}

impl FlapRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            stamps: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.capacity > 0 && self.stamps.len() == self.capacity
    }

    pub fn push(&mut self, timestamp: i64) {
        if self.capacity == 0 {
            return;
        }
        if self.stamps.len() == self.capacity {
            self.stamps.pop_back();
        }
        self.stamps.push_front(timestamp);
    }

    pub fn newest(&self) -> Option<i64> {
        self.stamps.front().copied()
    }

    pub fn oldest(&self) -> Option<i64> {
        self.stamps.back().copied()
    }

    /// Seconds between the oldest remembered change and `now`, once the
    /// ring has filled up. `None` while fewer than `capacity` changes are known.
    pub fn span(&self, now: i64) -> Option<i64> {
        if self.is_full() {
            self.oldest().map(|oldest| now - oldest)
        } else {
            None
        }
    }

    /// Whether `capacity` changes happened less than `threshold` seconds ago.
    pub fn is_flapping(&self, now: i64, threshold: i64) -> bool {
        self.span(now).is_some_and(|span| span < threshold)
    }

    pub fn iter(&self) -> impl Iterator<Item = i64> + '_ {
        self.stamps.iter().copied()
    }
}
