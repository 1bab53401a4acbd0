//! Single-slot broadcast with an all-readers handshake
//!
//! One producer, any number of readers. The channel holds exactly one
//! message. A post waits until every reader attached at the time of the
//! previous post has taken its copy, then replaces the slot and releases
//! all readers at once:
//!
//! ```text
//! producer                          reader 1..N
//!    │ wait pending == {}              │
//!    │ (bounded by post_timeout)       │
//!    │ pending = readers               │
//!    │ slot = message ───────────────► │ changed()
//!    │                                 │ copy slot
//!    │ ◄─────────────────────────────  │ pending.remove(self)
//! ```
//!
//! A reader that stops calling [`ChannelReader::recv`] stalls the producer
//! for at most `post_timeout` per post; the post is then abandoned and
//! logged. A reader that is dropped leaves the reader set immediately.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, instrument, trace, warn};

use super::ChannelKind;
use super::message::{Envelope, next_seq};
use crate::error::{BoardError, BoardResult};
use crate::util::now_timestamp;

/// A message as it sits in the slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub seq: u32,
    pub text: String,
}

#[derive(Debug, Default)]
struct Handshake {
    readers: BTreeSet<u64>,
    /// Readers that have not yet taken the current message
    pending: BTreeSet<u64>,
}

#[derive(Debug)]
struct Shared {
    kind: ChannelKind,
    handshake: watch::Sender<Handshake>,
    /// Never read; new readers are cloned from it
    slot_rx: watch::Receiver<Option<Arc<Delivery>>>,
    next_reader: AtomicU64,
}

/// What happened to a posted message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOutcome {
    /// Handed to this many readers
    Delivered { seq: u32, readers: usize },
    /// Nobody is listening; the message was discarded
    NoReaders,
}

/// Counters kept by the producer side
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub posted: u64,
    pub no_readers: u64,
    pub abandoned: u64,
}

/// Producer side of a channel. Owned by the status store actor.
#[derive(Debug)]
pub struct BoardChannel {
    shared: Arc<Shared>,
    /// Dropping the channel drops the only sender, which ends every reader
    slot: watch::Sender<Option<Arc<Delivery>>>,
    seq: u32,
    post_timeout: Duration,
    stats: ChannelStats,
}

impl BoardChannel {
    pub fn new(kind: ChannelKind, post_timeout: Duration) -> Self {
        let (handshake, _) = watch::channel(Handshake::default());
        let (slot, slot_rx) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                kind,
                handshake,
                slot_rx,
                next_reader: AtomicU64::new(1),
            }),
            slot,
            seq: 0,
            post_timeout,
            stats: ChannelStats::default(),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.shared.kind
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    pub fn reader_count(&self) -> usize {
        self.shared.handshake.borrow().readers.len()
    }

    /// A cloneable handle that lets other tasks attach readers.
    pub fn attacher(&self) -> ChannelAttacher {
        ChannelAttacher {
            shared: self.shared.clone(),
        }
    }

    /// Post a message to every attached reader.
    ///
    /// Waits for the readers of the previous message first. On timeout the
    /// message is abandoned and [`BoardError::ChannelTimeout`] is returned.
    #[instrument(skip_all, fields(channel = %self.shared.kind, marker = %envelope.marker))]
    pub async fn post(&mut self, envelope: &Envelope) -> BoardResult<PostOutcome> {
        if self.reader_count() == 0 {
            trace!("no readers, dropping message");
            self.stats.no_readers += 1;
            return Ok(PostOutcome::NoReaders);
        }

        let mut handshake_rx = self.shared.handshake.subscribe();
        let waited =
            tokio::time::timeout(self.post_timeout, handshake_rx.wait_for(|h| h.pending.is_empty()))
                .await;
        match waited {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => return Err(BoardError::ChannelClosed(self.shared.kind.name())),
            Err(_) => {
                self.stats.abandoned += 1;
                warn!(
                    "readers still busy after {}ms, abandoning message",
                    self.post_timeout.as_millis()
                );
                return Err(BoardError::ChannelTimeout {
                    channel: self.shared.kind.name(),
                    waited: self.post_timeout,
                });
            }
        }

        self.seq = next_seq(self.seq);
        let (sec, usec) = now_timestamp();
        let delivery = Arc::new(Delivery {
            seq: self.seq,
            text: envelope.encode(self.seq, sec, usec),
        });

        let mut readers = 0;
        let slot = &self.slot;
        self.shared.handshake.send_modify(|h| {
            h.pending = h.readers.clone();
            readers = h.readers.len();
            slot.send_replace(Some(delivery));
        });
        self.stats.posted += 1;

        if readers == 0 {
            // every reader left while we were waiting
            self.stats.no_readers += 1;
            return Ok(PostOutcome::NoReaders);
        }
        trace!(seq = self.seq, readers, "posted");
        Ok(PostOutcome::Delivered {
            seq: self.seq,
            readers,
        })
    }
}

/// Attaches new readers to a channel from any task
#[derive(Debug, Clone)]
pub struct ChannelAttacher {
    shared: Arc<Shared>,
}

impl ChannelAttacher {
    pub fn kind(&self) -> ChannelKind {
        self.shared.kind
    }

    /// Join the reader set. The reader sees messages posted from now on.
    pub fn attach(&self) -> ChannelReader {
        let id = self.shared.next_reader.fetch_add(1, Ordering::Relaxed);
        let mut slot_rx = self.shared.slot_rx.clone();
        self.shared.handshake.send_modify(|h| {
            h.readers.insert(id);
            // only messages posted from now on count as new
            slot_rx.borrow_and_update();
        });
        debug!(channel = %self.shared.kind, reader = id, "reader attached");
        ChannelReader {
            id,
            shared: self.shared.clone(),
            slot: slot_rx,
        }
    }
}

/// Reader side of a channel
#[derive(Debug)]
pub struct ChannelReader {
    id: u64,
    shared: Arc<Shared>,
    slot: watch::Receiver<Option<Arc<Delivery>>>,
}

impl ChannelReader {
    pub fn kind(&self) -> ChannelKind {
        self.shared.kind
    }

    /// Wait for the next message and take a copy of it.
    ///
    /// Taking the copy releases this reader's hold on the producer. Returns
    /// `None` once the producer is gone.
    pub async fn recv(&mut self) -> Option<Arc<Delivery>> {
        loop {
            self.slot.changed().await.ok()?;
            let delivery = self.slot.borrow_and_update().clone();
            self.release();
            if delivery.is_some() {
                return delivery;
            }
        }
    }

    fn release(&self) {
        let id = self.id;
        self.shared.handshake.send_if_modified(|h| h.pending.remove(&id));
    }
}

impl Drop for ChannelReader {
    fn drop(&mut self) {
        let id = self.id;
        self.shared.handshake.send_modify(|h| {
            h.readers.remove(&id);
            h.pending.remove(&id);
        });
        debug!(channel = %self.shared.kind, reader = id, "reader detached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn envelope(n: usize) -> Envelope {
        Envelope::new("status", "host", "test").field(n)
    }

    #[tokio::test]
    async fn test_post_without_readers_is_dropped() {
        let mut channel = BoardChannel::new(ChannelKind::Status, Duration::from_millis(50));
        let outcome = channel.post(&envelope(1)).await.unwrap();
        assert_eq!(outcome, PostOutcome::NoReaders);
        assert_eq!(channel.stats().no_readers, 1);
    }

    #[tokio::test]
    async fn test_every_reader_sees_every_message_in_order() {
        let mut channel = BoardChannel::new(ChannelKind::Status, Duration::from_secs(5));
        let attacher = channel.attacher();

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let mut reader = attacher.attach();
            tasks.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(delivery) = reader.recv().await {
                    seen.push(delivery.seq);
                    if seen.len() == 20 {
                        break;
                    }
                }
                seen
            }));
        }

        for n in 0..20 {
            let outcome = channel.post(&envelope(n)).await.unwrap();
            assert_matches!(outcome, PostOutcome::Delivered { readers: 3, .. });
        }

        for task in tasks {
            let seen = task.await.unwrap();
            assert_eq!(seen, (1..=20).collect::<Vec<u32>>());
        }
    }

    #[tokio::test]
    async fn test_stuck_reader_abandons_post_after_timeout() {
        let mut channel = BoardChannel::new(ChannelKind::Page, Duration::from_millis(30));
        let _stuck = channel.attacher().attach();

        // first post goes straight through, the reader never takes it
        channel.post(&envelope(1)).await.unwrap();
        let err = channel.post(&envelope(2)).await.unwrap_err();
        assert_matches!(err, BoardError::ChannelTimeout { channel: "page", .. });
        assert_eq!(channel.stats().abandoned, 1);
    }

    #[tokio::test]
    async fn test_dropping_reader_releases_producer() {
        let mut channel = BoardChannel::new(ChannelKind::Stachg, Duration::from_secs(5));
        let stuck = channel.attacher().attach();
        channel.post(&envelope(1)).await.unwrap();

        drop(stuck);
        let outcome = channel.post(&envelope(2)).await.unwrap();
        assert_eq!(outcome, PostOutcome::NoReaders);
    }

    #[tokio::test]
    async fn test_late_reader_only_sees_new_messages() {
        let mut channel = BoardChannel::new(ChannelKind::Status, Duration::from_secs(5));
        let attacher = channel.attacher();
        let mut early = attacher.attach();

        channel.post(&envelope(1)).await.unwrap();
        assert_eq!(early.recv().await.unwrap().seq, 1);

        let mut late = attacher.attach();
        channel.post(&envelope(2)).await.unwrap();
        assert_eq!(late.recv().await.unwrap().seq, 2);
        assert_eq!(early.recv().await.unwrap().seq, 2);
    }

    #[tokio::test]
    async fn test_readers_end_when_channel_goes_away() {
        let mut channel = BoardChannel::new(ChannelKind::Data, Duration::from_secs(5));
        let mut reader = channel.attacher().attach();
        channel.post(&envelope(1)).await.unwrap();
        drop(channel);

        assert_eq!(reader.recv().await.unwrap().seq, 1);
        assert_eq!(reader.recv().await, None);
    }
}
