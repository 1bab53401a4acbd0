//! Downstream peers of a fanout worker
//!
//! A peer is either a local child process fed through its stdin, or a
//! remote consumer reached over TCP. Each connected peer gets a writer task
//! so that a slow consumer never stalls the worker's read loop; the worker
//! hands messages over with `try_send` and keeps the overflow in its own
//! [`PeerQueue`].

use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::PeerSpec;

use super::queue::{PeerQueue, Queued};

/// Messages handed to a writer task but not yet written
const LINK_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Up,
    /// A connection attempt is running; messages wait in the queue
    Connecting,
    /// Not connected; a connection is attempted on the next message
    Down,
    /// Connection lost or refused; no attempt before the backoff passes
    Failed { since: Instant },
}

impl PeerState {
    pub fn name(&self) -> &'static str {
        match self {
            PeerState::Up => "up",
            PeerState::Connecting => "connecting",
            PeerState::Down => "down",
            PeerState::Failed { .. } => "failed",
        }
    }
}

/// An open connection to a peer
pub struct PeerConnection {
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// The peer process, for local peers. Killed when the connection drops.
    pub child: Option<Child>,
}

/// Opens connections to peers
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, spec: &PeerSpec) -> io::Result<PeerConnection>;
}

/// Spawns local peers and dials network peers
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConnector;

#[async_trait]
impl Connector for SystemConnector {
    async fn connect(&self, spec: &PeerSpec) -> io::Result<PeerConnection> {
        match spec {
            PeerSpec::Local { command, args } => {
                let mut child = Command::new(command)
                    .args(args)
                    .stdin(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()?;
                let stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| io::Error::other("child has no stdin"))?;
                Ok(PeerConnection {
                    writer: Box::new(stdin),
                    child: Some(child),
                })
            }
            PeerSpec::Network { address } => {
                let stream = TcpStream::connect(address.as_str()).await?;
                stream.set_nodelay(true)?;
                Ok(PeerConnection {
                    writer: Box::new(stream),
                    child: None,
                })
            }
        }
    }
}

pub fn peer_name(spec: &PeerSpec) -> String {
    match spec {
        PeerSpec::Local { command, .. } => command.clone(),
        PeerSpec::Network { address } => address.clone(),
    }
}

/// Outcome of a connection attempt started by [`Peer::begin_connect`]
pub struct ConnectResult {
    pub peer: usize,
    pub generation: u64,
    pub result: io::Result<PeerConnection>,
}

/// A writer task reporting that its peer is gone
#[derive(Debug)]
pub struct PeerFailure {
    pub peer: usize,
    pub generation: u64,
    pub reason: String,
}

pub struct Peer {
    pub name: String,
    pub spec: PeerSpec,
    pub state: PeerState,
    pub queue: PeerQueue,
    link: Option<mpsc::Sender<Queued>>,
    /// Bumped on every connection so failures of an old link are ignored
    generation: u64,
    handed_over: u64,
}

impl Peer {
    pub fn new(spec: PeerSpec, stale_after: Duration) -> Self {
        Self {
            name: peer_name(&spec),
            spec,
            state: PeerState::Down,
            queue: PeerQueue::new(stale_after),
            link: None,
            generation: 0,
            handed_over: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn handed_over(&self) -> u64 {
        self.handed_over
    }

    /// Messages queued locally or waiting in the writer task
    pub fn load(&self) -> usize {
        let in_flight = self
            .link
            .as_ref()
            .map_or(0, |link| link.max_capacity() - link.capacity());
        self.queue.len() + in_flight
    }

    /// A failed peer becomes eligible for reconnection once the backoff passed.
    pub fn refresh(&mut self, now: Instant, backoff: Duration) {
        if let PeerState::Failed { since } = self.state {
            if now.saturating_duration_since(since) >= backoff {
                debug!(peer = %self.name, "backoff over, peer marked down");
                self.state = PeerState::Down;
            }
        }
    }

    /// Mark a connection attempt as running. The returned generation tags
    /// its result; results of superseded attempts are ignored.
    pub fn begin_connect(&mut self) -> u64 {
        self.generation += 1;
        self.state = PeerState::Connecting;
        self.generation
    }

    /// Start a writer task on a fresh connection.
    pub fn attach(
        &mut self,
        index: usize,
        connection: PeerConnection,
        stale_after: Duration,
        failures: mpsc::Sender<PeerFailure>,
    ) {
        self.generation += 1;
        let (tx, rx) = mpsc::channel(LINK_CAPACITY);
        tokio::spawn(run_writer(
            self.name.clone(),
            index,
            self.generation,
            connection,
            rx,
            stale_after,
            failures,
        ));
        self.link = Some(tx);
        self.state = PeerState::Up;
    }

    /// Mark the peer failed and throw its queue away.
    pub fn fail(&mut self, now: Instant) -> usize {
        self.link = None;
        self.state = PeerState::Failed { since: now };
        self.queue.clear()
    }

    /// Hand over as many fresh queued messages as the writer task accepts.
    /// Returns false if the writer task is gone.
    pub fn flush(&mut self, now: Instant) -> bool {
        let Some(link) = &self.link else {
            return true;
        };
        while let Some(item) = self.queue.pop_fresh(now) {
            match link.try_send(item) {
                Ok(()) => self.handed_over += 1,
                Err(TrySendError::Full(item)) => {
                    trace!(peer = %self.name, "peer busy, {} queued", self.queue.len() + 1);
                    self.queue.requeue(item);
                    break;
                }
                Err(TrySendError::Closed(_)) => return false,
            }
        }
        true
    }
}

async fn wait_child(child: &mut Option<Child>) -> io::Result<std::process::ExitStatus> {
    match child {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}

async fn run_writer(
    name: String,
    peer: usize,
    generation: u64,
    mut connection: PeerConnection,
    mut rx: mpsc::Receiver<Queued>,
    stale_after: Duration,
    failures: mpsc::Sender<PeerFailure>,
) {
    debug!(peer = %name, generation, "writer started");
    let reason = loop {
        tokio::select! {
            item = rx.recv() => {
                let Some(item) = item else {
                    // link dropped by the worker
                    break None;
                };
                if item.is_stale(Instant::now(), stale_after) {
                    trace!(peer = %name, "dropping stale message");
                    continue;
                }
                let written = async {
                    connection.writer.write_all(item.text.as_bytes()).await?;
                    connection.writer.flush().await
                };
                if let Err(e) = written.await {
                    break Some(format!("write failed: {e}"));
                }
            }
            status = wait_child(&mut connection.child) => {
                break Some(match status {
                    Ok(status) => format!("peer process exited with {status}"),
                    Err(e) => format!("peer process lost: {e}"),
                });
            }
        }
    };

    if let Some(reason) = reason {
        warn!(peer = %name, "{reason}");
        let _ = failures
            .send(PeerFailure {
                peer,
                generation,
                reason,
            })
            .await;
    }
    debug!(peer = %name, generation, "writer stopped");
}
