//! Broadcast channels between the status store and its workers
//!
//! The store is the only producer. Each logical channel carries one kind of
//! event:
//!
//! - **status**: every applied report
//! - **stachg**: color changes (history)
//! - **page**: alert state changes, acks and notifications (alerter)
//! - **data**: `data` messages (graphing)
//! - **enadis**: enable/disable events
//!
//! Drop and rename commands are sent to all of them.

pub mod broadcast;
pub mod message;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub use broadcast::{BoardChannel, ChannelAttacher, ChannelReader, ChannelStats, Delivery, PostOutcome};
pub use message::{ChannelMessage, Envelope};

use crate::error::BoardResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Status,
    Stachg,
    Page,
    Data,
    Enadis,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 5] = [
        ChannelKind::Status,
        ChannelKind::Stachg,
        ChannelKind::Page,
        ChannelKind::Data,
        ChannelKind::Enadis,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ChannelKind::Status => "status",
            ChannelKind::Stachg => "stachg",
            ChannelKind::Page => "page",
            ChannelKind::Data => "data",
            ChannelKind::Enadis => "enadis",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which channels a message goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    One(ChannelKind),
    All,
}

/// A message the store wants published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posting {
    pub route: Route,
    pub envelope: Envelope,
}

impl Posting {
    pub fn to(channel: ChannelKind, envelope: Envelope) -> Self {
        Self {
            route: Route::One(channel),
            envelope,
        }
    }

    pub fn to_all(envelope: Envelope) -> Self {
        Self {
            route: Route::All,
            envelope,
        }
    }

    pub fn goes_to(&self, channel: ChannelKind) -> bool {
        match self.route {
            Route::One(kind) => kind == channel,
            Route::All => true,
        }
    }
}

/// The full set of channels owned by the store actor
#[derive(Debug)]
pub struct ChannelSet {
    channels: BTreeMap<ChannelKind, BoardChannel>,
}

impl ChannelSet {
    pub fn new(post_timeout: Duration) -> Self {
        let channels = ChannelKind::ALL
            .into_iter()
            .map(|kind| (kind, BoardChannel::new(kind, post_timeout)))
            .collect();
        Self { channels }
    }

    pub fn attacher(&self, kind: ChannelKind) -> Option<ChannelAttacher> {
        self.channels.get(&kind).map(BoardChannel::attacher)
    }

    pub fn stats(&self) -> Vec<(ChannelKind, ChannelStats)> {
        self.channels
            .iter()
            .map(|(kind, channel)| (*kind, channel.stats()))
            .collect()
    }

    /// Total number of abandoned posts across all channels
    pub fn abandoned(&self) -> u64 {
        self.channels.values().map(|c| c.stats().abandoned).sum()
    }

    /// Publish a posting. For [`Route::All`] the channels are posted to
    /// concurrently and every channel is tried even if one of them fails;
    /// the last error is returned.
    pub async fn post(&mut self, posting: &Posting) -> BoardResult<()> {
        let envelope = &posting.envelope;
        let posts = self
            .channels
            .iter_mut()
            .filter(|(kind, _)| posting.goes_to(**kind))
            .map(|(kind, channel)| async move { (*kind, channel.post(envelope).await) });

        let mut result = Ok(());
        for (kind, outcome) in join_all(posts).await {
            if let Err(e) = outcome {
                warn!("post to {kind} failed: {e}");
                result = Err(e);
            }
        }
        result
    }
}
