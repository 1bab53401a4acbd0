//! FanoutWorker - relays one broadcast channel to downstream peers
//!
//! ## Message Flow
//!
//! ```text
//! ChannelReader ─► sequence check ─► filter ─► routing ─► PeerQueue ─► writer task ─► peer
//!                                                 │
//!                                   single / broadcast / least-loaded / locator
//! ```
//!
//! The worker takes every message off the channel as soon as it is posted
//! and never waits on a peer. Connection attempts run as their own tasks
//! and report back to the worker; each connected peer has its own writer
//! task, and anything the task cannot take right now waits in the peer's
//! queue until it goes stale. Failed peers lose their queue and are retried
//! no more than once per backoff window.

pub mod locator;
pub mod peer;
pub mod queue;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, interval, timeout};
use tracing::{debug, info, instrument, trace, warn};

use crate::channel::message::{SeqCheck, SequenceTracker};
use crate::channel::{ChannelAttacher, ChannelKind, ChannelMessage, ChannelReader, Delivery};
use crate::config::{Routing, WorkerConfig};
use crate::error::BoardResult;

pub use locator::{Locator, StaticLocator};
pub use peer::{Connector, PeerConnection, PeerState, SystemConnector};

use peer::{ConnectResult, Peer, PeerFailure};

/// Housekeeping tick: retry queued messages
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub name: String,
    pub state: &'static str,
    pub queued: usize,
    pub handed_over: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutStats {
    pub received: u64,
    pub filtered: u64,
    pub unroutable: u64,
    /// Messages the channel skipped before this worker saw them
    pub lost: u64,
    pub peers: Vec<PeerStatus>,
}

pub enum FanoutCommand {
    Stats {
        respond_to: oneshot::Sender<FanoutStats>,
    },
    Shutdown,
}

pub struct FanoutWorker {
    name: String,
    reader: ChannelReader,
    peers: Vec<Peer>,
    routing: Routing,
    locator: Option<Box<dyn Locator>>,
    filter: Option<Regex>,
    connector: Arc<dyn Connector>,
    stale_after: Duration,
    backoff: Duration,
    failure_tx: mpsc::Sender<PeerFailure>,
    failure_rx: mpsc::Receiver<PeerFailure>,
    connect_tx: mpsc::Sender<ConnectResult>,
    connect_rx: mpsc::Receiver<ConnectResult>,
    command_rx: mpsc::Receiver<FanoutCommand>,
    sequence: SequenceTracker,
    stats: FanoutStats,
}

impl FanoutWorker {
    pub fn new(
        config: &WorkerConfig,
        reader: ChannelReader,
        connector: Arc<dyn Connector>,
        command_rx: mpsc::Receiver<FanoutCommand>,
    ) -> BoardResult<Self> {
        let stale_after = Duration::from_secs(config.message_timeout_secs);
        let filter = config.filter.as_deref().map(Regex::new).transpose()?;
        let locator: Option<Box<dyn Locator>> = match config.routing {
            Routing::Locator => Some(Box::new(StaticLocator::new(
                config.locator.clone().unwrap_or_default(),
            ))),
            _ => None,
        };
        let (failure_tx, failure_rx) = mpsc::channel(32);
        let (connect_tx, connect_rx) = mpsc::channel(32);

        Ok(Self {
            name: config
                .name
                .clone()
                .unwrap_or_else(|| format!("{}-fanout", config.channel)),
            reader,
            peers: config
                .peers
                .iter()
                .cloned()
                .map(|spec| Peer::new(spec, stale_after))
                .collect(),
            routing: config.routing,
            locator,
            filter,
            connector,
            stale_after,
            backoff: Duration::from_secs(config.reconnect_backoff_secs),
            failure_tx,
            failure_rx,
            connect_tx,
            connect_rx,
            command_rx,
            sequence: SequenceTracker::default(),
            stats: FanoutStats::default(),
        })
    }

    /// Replace the locator used for [`Routing::Locator`].
    pub fn with_locator(mut self, locator: Box<dyn Locator>) -> Self {
        self.locator = Some(locator);
        self
    }

    #[instrument(skip(self), fields(worker = %self.name))]
    pub async fn run(mut self) {
        info!(
            "relaying {} channel to {} peers",
            self.reader.kind(),
            self.peers.len()
        );
        let mut ticker = interval(FLUSH_INTERVAL);

        loop {
            tokio::select! {
                delivery = self.reader.recv() => {
                    match delivery {
                        Some(delivery) => self.handle_delivery(&delivery).await,
                        None => {
                            debug!("channel closed");
                            break;
                        }
                    }
                }

                Some(connected) = self.connect_rx.recv() => self.handle_connect(connected),

                Some(failure) = self.failure_rx.recv() => self.handle_failure(failure),

                _ = ticker.tick() => self.flush_all(),

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        FanoutCommand::Stats { respond_to } => {
                            let _ = respond_to.send(self.snapshot());
                        }
                        FanoutCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }

                else => break,
            }
        }

        debug!("fanout worker stopped");
    }

    async fn handle_delivery(&mut self, delivery: &Delivery) {
        self.stats.received += 1;
        match self.sequence.observe(delivery.seq) {
            SeqCheck::Gap(missed) => {
                warn!("missed {missed} messages before #{}", delivery.seq);
                self.stats.lost += u64::from(missed);
            }
            SeqCheck::Repeated => {
                debug!("message #{} seen twice, skipped", delivery.seq);
                return;
            }
            SeqCheck::First | SeqCheck::InOrder => {}
        }

        let message = match ChannelMessage::decode(&delivery.text) {
            Ok(message) => message,
            Err(e) => {
                warn!("undecodable message #{}: {e}", delivery.seq);
                return;
            }
        };

        if let Some(filter) = &self.filter {
            let header = delivery.text.lines().next().unwrap_or_default();
            if !message.is_control() && !filter.is_match(header) {
                trace!("message #{} filtered", delivery.seq);
                self.stats.filtered += 1;
                return;
            }
        }

        let targets = self.route(&message).await;
        if targets.is_empty() {
            debug!("no peer for key {}", message.key);
            self.stats.unroutable += 1;
            return;
        }

        let text: Arc<str> = Arc::from(delivery.text.as_str());
        for index in targets {
            self.deliver(index, text.clone());
        }
    }

    async fn route(&self, message: &ChannelMessage) -> Vec<usize> {
        if self.peers.is_empty() {
            return Vec::new();
        }
        if message.key == "*" {
            return (0..self.peers.len()).collect();
        }
        match self.routing {
            Routing::Single => vec![0],
            Routing::Broadcast => (0..self.peers.len()).collect(),
            Routing::LeastLoaded => self.least_loaded().into_iter().collect(),
            Routing::Locator => {
                let Some(locator) = &self.locator else {
                    return Vec::new();
                };
                match locator.locate(&message.key).await {
                    Some(name) => self
                        .peers
                        .iter()
                        .position(|p| p.name == name)
                        .into_iter()
                        .collect(),
                    None => Vec::new(),
                }
            }
        }
    }

    /// The connected peer with the shortest backlog, else any peer that may
    /// be (re)connected.
    fn least_loaded(&self) -> Option<usize> {
        let now = Instant::now();
        let up = self
            .peers
            .iter()
            .enumerate()
            .filter(|(_, p)| p.state == PeerState::Up)
            .min_by_key(|(_, p)| p.load())
            .map(|(i, _)| i);
        up.or_else(|| {
            self.peers.iter().position(|p| match p.state {
                PeerState::Failed { since } => now.saturating_duration_since(since) >= self.backoff,
                _ => true,
            })
        })
        .or(Some(0))
    }

    fn deliver(&mut self, index: usize, text: Arc<str>) {
        let now = Instant::now();
        self.peers[index].refresh(now, self.backoff);
        if self.peers[index].state == PeerState::Down {
            self.connect(index);
        }

        let peer = &mut self.peers[index];
        match peer.state {
            PeerState::Up => {
                peer.queue.push(text, now);
                if !peer.flush(now) {
                    let lost = peer.fail(now);
                    warn!(peer = %peer.name, "writer gone, {lost} queued messages discarded");
                }
            }
            PeerState::Connecting => peer.queue.push(text, now),
            PeerState::Down | PeerState::Failed { .. } => {
                // an unreachable peer only keeps the latest message
                peer.queue.clear();
                peer.queue.push(text, now);
            }
        }
    }

    /// Start a connection attempt in the background.
    fn connect(&mut self, index: usize) {
        let peer = &mut self.peers[index];
        let generation = peer.begin_connect();
        let spec = peer.spec.clone();
        let connector = self.connector.clone();
        let results = self.connect_tx.clone();
        debug!(peer = %peer.name, "connecting");

        tokio::spawn(async move {
            let result = match timeout(CONNECT_TIMEOUT, connector.connect(&spec)).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
            };
            let _ = results
                .send(ConnectResult {
                    peer: index,
                    generation,
                    result,
                })
                .await;
        });
    }

    fn handle_connect(&mut self, connected: ConnectResult) {
        let Some(peer) = self.peers.get_mut(connected.peer) else {
            return;
        };
        if peer.state != PeerState::Connecting || peer.generation() != connected.generation {
            trace!(peer = %peer.name, "result of an old connection attempt ignored");
            return;
        }
        let now = Instant::now();
        match connected.result {
            Ok(connection) => {
                info!(peer = %peer.name, "peer connected");
                peer.attach(connected.peer, connection, self.stale_after, self.failure_tx.clone());
                if !peer.flush(now) {
                    let lost = peer.fail(now);
                    warn!(peer = %peer.name, "writer gone, {lost} queued messages discarded");
                }
            }
            Err(e) => {
                let lost = peer.fail(now);
                warn!(peer = %peer.name, "cannot connect: {e}, {lost} queued messages discarded");
            }
        }
    }

    fn handle_failure(&mut self, failure: PeerFailure) {
        let Some(peer) = self.peers.get_mut(failure.peer) else {
            return;
        };
        if peer.generation() != failure.generation {
            trace!(peer = %peer.name, "failure of an old connection ignored");
            return;
        }
        let lost = peer.fail(Instant::now());
        warn!(
            peer = %peer.name,
            "peer down ({}), {lost} queued messages discarded",
            failure.reason
        );
    }

    fn flush_all(&mut self) {
        let now = Instant::now();
        for peer in self.peers.iter_mut() {
            peer.refresh(now, self.backoff);
            if peer.state == PeerState::Up && !peer.flush(now) {
                let lost = peer.fail(now);
                warn!(peer = %peer.name, "writer gone, {lost} queued messages discarded");
            }
        }
    }

    fn snapshot(&self) -> FanoutStats {
        FanoutStats {
            peers: self
                .peers
                .iter()
                .map(|p| PeerStatus {
                    name: p.name.clone(),
                    state: p.state.name(),
                    queued: p.queue.len(),
                    handed_over: p.handed_over(),
                    dropped: p.queue.dropped(),
                })
                .collect(),
            ..self.stats.clone()
        }
    }
}

/// Handle for controlling a FanoutWorker
#[derive(Clone)]
pub struct FanoutHandle {
    kind: ChannelKind,
    sender: mpsc::Sender<FanoutCommand>,
}

impl FanoutHandle {
    /// Attach a reader to the channel and spawn the worker.
    ///
    /// The reader is attached before this returns, so every message posted
    /// afterwards reaches the worker.
    pub fn spawn(
        config: &WorkerConfig,
        attacher: &ChannelAttacher,
        connector: Arc<dyn Connector>,
    ) -> BoardResult<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let worker = FanoutWorker::new(config, attacher.attach(), connector, cmd_rx)?;
        tokio::spawn(worker.run());
        Ok(Self {
            kind: attacher.kind(),
            sender: cmd_tx,
        })
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub async fn stats(&self) -> Option<FanoutStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(FanoutCommand::Stats { respond_to: tx })
            .await
            .ok()?;
        rx.await.ok()
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(FanoutCommand::Shutdown).await;
    }
}
