//! BoardActor - single owner of the status store and its channels
//!
//! ## Message Flow
//!
//! ```text
//! connection tasks ──► BoardCommand ──► BoardActor ──► StatusStore ──► Posting ──► ChannelSet
//!                                          │                                        │
//!                       tick: sweep / checkpoint / self status            fanout workers
//! ```
//!
//! Every store mutation happens on this task, so reports for the same
//! host/test are applied strictly in arrival order.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::channel::{ChannelAttacher, ChannelKind, ChannelSet, Posting};
use crate::color::Color;
use crate::config::{DaemonConfig, HostConfig};
use crate::error::{BoardError, BoardResult};
use crate::store::checkpoint::{read_checkpoint, write_checkpoint};
use crate::store::machine::INTERNAL_SENDER;
use crate::store::{StatusReport, StatusStore};
use crate::util::now_secs;

use super::protocol::Request;

/// Fallback period for housekeeping that is not configured
const IDLE_PERIOD: Duration = Duration::from_secs(3600);

/// Name of the test the daemon reports about itself
pub const SELF_TEST: &str = "boardwatchd";

pub enum BoardCommand {
    /// A complete client message; the reply, if any, goes to `respond_to`
    Message {
        text: String,
        sender: IpAddr,
        respond_to: oneshot::Sender<Option<String>>,
    },
    /// Oversized or timed out input the server dropped
    Rejected,
    ReloadHosts {
        hosts: Vec<HostConfig>,
    },
    Stats {
        respond_to: oneshot::Sender<BoardStats>,
    },
    /// Stop after writing the final checkpoint, then signal `done`
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Problems seen since the last self-status report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub messages: u64,
    pub dropped: u64,
    pub unauthorized: u64,
    pub ghosts: u64,
}

impl Counters {
    fn errors(&self) -> u64 {
        self.dropped + self.unauthorized + self.ghosts
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoardStats {
    pub hosts: usize,
    pub records: usize,
    pub cookies: usize,
    pub abandoned_posts: u64,
    pub counters: Counters,
}

/// Loopback may always administer; an empty admin list lets anyone.
pub fn is_admin(sender: IpAddr, admins: &[IpAddr]) -> bool {
    admins.is_empty() || sender.is_loopback() || admins.contains(&sender)
}

struct Outcome {
    postings: Vec<Posting>,
    response: Option<String>,
}

impl Outcome {
    fn postings(postings: Vec<Posting>) -> Self {
        Self {
            postings,
            response: None,
        }
    }

    fn response(response: String) -> Self {
        Self {
            postings: Vec::new(),
            response: Some(response),
        }
    }
}

pub struct BoardActor {
    config: DaemonConfig,
    store: StatusStore,
    channels: ChannelSet,
    receiver: mpsc::Receiver<BoardCommand>,
    sender: mpsc::Sender<BoardCommand>,
    counters: Counters,
    /// Abandoned posts already accounted for in a self-status report
    reported_abandoned: u64,
}

impl BoardActor {
    /// Build the store from the configured hosts and restore the last
    /// checkpoint, if any.
    pub fn new(config: DaemonConfig) -> Self {
        let (sender, receiver) = mpsc::channel(256);
        let mut store = StatusStore::new(config.store.clone(), &config.hosts);

        if let Some(checkpoint) = &config.checkpoint {
            if checkpoint.path.exists() {
                match read_checkpoint(&checkpoint.path) {
                    Ok(text) => {
                        let summary = store.restore(&text, now_secs());
                        info!(
                            "restored {} records from {} ({} skipped)",
                            summary.restored,
                            checkpoint.path.display(),
                            summary.skipped
                        );
                    }
                    Err(e) => warn!("cannot read checkpoint: {e}"),
                }
            }
        }

        Self {
            channels: ChannelSet::new(Duration::from_secs(config.post_timeout_secs)),
            config,
            store,
            receiver,
            sender,
            counters: Counters::default(),
            reported_abandoned: 0,
        }
    }

    /// Attach point for a reader of one channel. Readers attached before
    /// the actor runs see every message.
    pub fn attacher(&self, kind: ChannelKind) -> Option<ChannelAttacher> {
        self.channels.attacher(kind)
    }

    pub fn handle(&self) -> BoardHandle {
        BoardHandle {
            sender: self.sender.clone(),
        }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        info!("status board running with {} hosts", self.store.host_count());

        let mut sweep = interval(Duration::from_secs(self.config.sweep_interval_secs.max(1)));
        let mut checkpoint = interval(
            self.config
                .checkpoint
                .as_ref()
                .map_or(IDLE_PERIOD, |c| Duration::from_secs(c.interval_secs.max(1))),
        );
        let mut self_status = interval(
            self.config
                .self_status
                .as_ref()
                .map_or(IDLE_PERIOD, |s| Duration::from_secs(s.interval_secs.max(1))),
        );
        for ticker in [&mut sweep, &mut checkpoint, &mut self_status] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        // the first tick of an interval fires at once
        checkpoint.tick().await;
        self_status.tick().await;

        let mut done = None;
        loop {
            tokio::select! {
                Some(cmd) = self.receiver.recv() => {
                    match cmd {
                        BoardCommand::Message { text, sender, respond_to } => {
                            let response = self.handle_message(&text, sender).await;
                            let _ = respond_to.send(response);
                        }
                        BoardCommand::Rejected => self.counters.dropped += 1,
                        BoardCommand::ReloadHosts { hosts } => {
                            let postings = self.store.reload_hosts(&hosts, INTERNAL_SENDER);
                            info!("host list reloaded: {} hosts", self.store.host_count());
                            self.publish(postings).await;
                        }
                        BoardCommand::Stats { respond_to } => {
                            let _ = respond_to.send(self.stats());
                        }
                        BoardCommand::Shutdown { done: tx } => {
                            debug!("received shutdown command");
                            done = Some(tx);
                            break;
                        }
                    }
                }

                _ = sweep.tick() => {
                    let postings = self.store.sweep_stale(now_secs());
                    if !postings.is_empty() {
                        debug!("stale sweep produced {} postings", postings.len());
                    }
                    self.publish(postings).await;
                }

                _ = checkpoint.tick() => self.save_checkpoint(false),

                _ = self_status.tick() => self.report_self().await,

                else => break,
            }
        }

        self.save_checkpoint(true);
        debug!("status board stopped");
        // closes every channel, so readers are done before the caller hears back
        drop(self);
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    fn stats(&self) -> BoardStats {
        BoardStats {
            hosts: self.store.host_count(),
            records: self.store.record_count(),
            cookies: self.store.live_cookies(),
            abandoned_posts: self.channels.abandoned(),
            counters: self.counters,
        }
    }

    async fn handle_message(&mut self, text: &str, sender: IpAddr) -> Option<String> {
        self.counters.messages += 1;
        let request = match Request::parse(text) {
            Ok(request) => request,
            Err(e) => {
                warn!(%sender, "dropped message: {e}");
                self.counters.dropped += 1;
                return None;
            }
        };
        trace!(%sender, command = request.name(), "request");

        if request.is_privileged() && !is_admin(sender, &self.config.server.admin_senders) {
            let e = BoardError::Unauthorized {
                sender: sender.to_string(),
                command: request.name().to_string(),
            };
            warn!("{e}");
            self.counters.unauthorized += 1;
            return None;
        }

        match self.execute(request, &sender.to_string(), now_secs()) {
            Ok(outcome) => {
                self.publish(outcome.postings).await;
                outcome.response
            }
            Err(e) => {
                self.note_error(e);
                None
            }
        }
    }

    fn note_error(&mut self, e: BoardError) {
        match e {
            BoardError::GhostHost(host) => {
                debug!("report for unknown host {host} discarded");
                self.counters.ghosts += 1;
            }
            BoardError::NotFound(what) => debug!("no such record: {what}"),
            e => {
                warn!("request failed: {e}");
                self.counters.dropped += 1;
            }
        }
    }

    fn execute(&mut self, request: Request, sender: &str, now: i64) -> BoardResult<Outcome> {
        let store = &mut self.store;
        let outcome = match request {
            Request::Status(report) => Outcome::postings(store.apply_report(&report, sender, now)?),
            Request::Combo(reports) => {
                let mut postings = Vec::new();
                for report in &reports {
                    match self.store.apply_report(report, sender, now) {
                        Ok(p) => postings.extend(p),
                        Err(e) => self.note_error(e),
                    }
                }
                Outcome::postings(postings)
            }
            Request::Data { host, name, body } => {
                Outcome::postings(store.data(&host, &name, &body, sender, now)?)
            }
            Request::Enable { host, test } => Outcome::postings(store.enable(&host, &test, sender, now)?),
            Request::Disable {
                host,
                test,
                duration,
                reason,
            } => Outcome::postings(store.disable(&host, &test, duration, &reason, sender, now)?),
            Request::Ack {
                target,
                cookie,
                minutes,
                message,
            } => {
                let target = target.as_ref().map(|(h, t)| (h.as_str(), t.as_str()));
                Outcome::postings(store.ack(cookie, target, minutes, &message, sender, now)?)
            }
            Request::Drop { host, test: None } => Outcome::postings(store.drop_host(&host, sender)?),
            Request::Drop {
                host,
                test: Some(test),
            } => Outcome::postings(store.drop_test(&host, &test, sender)?),
            Request::RenameHost { host, new_name } => {
                Outcome::postings(store.rename_host(&host, &new_name, sender)?)
            }
            Request::RenameTest {
                host,
                test,
                new_name,
            } => Outcome::postings(store.rename_test(&host, &test, &new_name, sender)?),
            Request::Modify {
                host,
                test,
                color,
                source,
                cause,
            } => Outcome::postings(store.modify(&host, &test, color, &source, &cause, sender, now)?),
            Request::Notify {
                host,
                test,
                message,
            } => Outcome::postings(store.notify(&host, &test, &message, sender)?),
            Request::Query { host, test } => Outcome::response(store.query(&host, &test)?),
            Request::Log { host, test } => Outcome::response(store.log(&host, &test)?),
            Request::Board(query) => Outcome::response(store.board(&query)),
            Request::GhostList => Outcome::response(store.ghost_list()),
            Request::Ping => Outcome::response(format!(
                "{SELF_TEST} {}\n",
                env!("CARGO_PKG_VERSION")
            )),
        };
        Ok(outcome)
    }

    async fn publish(&mut self, postings: Vec<Posting>) {
        for posting in &postings {
            // failures are logged and counted by the channel
            let _ = self.channels.post(posting).await;
        }
    }

    fn checkpoint_path(&self) -> Option<PathBuf> {
        self.config.checkpoint.as_ref().map(|c| c.path.clone())
    }

    fn save_checkpoint(&self, wait: bool) {
        let Some(path) = self.checkpoint_path() else {
            return;
        };
        let text = self.store.checkpoint_text();
        if wait {
            if let Err(e) = write_checkpoint(&path, &text) {
                error!("final checkpoint failed: {e}");
            }
            return;
        }
        tokio::task::spawn_blocking(move || {
            if let Err(e) = write_checkpoint(&path, &text) {
                error!("checkpoint failed: {e}");
            } else {
                trace!("checkpoint written to {}", path.display());
            }
        });
    }

    /// Report `SELFHOST.boardwatchd` with the counters since the last report.
    async fn report_self(&mut self) {
        let Some(host) = self.config.self_status.as_ref().map(|s| s.host.clone()) else {
            return;
        };
        let abandoned_total = self.channels.abandoned();
        let abandoned = abandoned_total - self.reported_abandoned;
        self.reported_abandoned = abandoned_total;

        let counters = std::mem::take(&mut self.counters);
        let color = if counters.errors() + abandoned > 0 {
            Color::Yellow
        } else {
            Color::Green
        };
        let message = format!(
            "{color} {SELF_TEST} running\n\n\
             Incoming messages: {}\n\
             Dropped messages:  {}\n\
             Unauthorized:      {}\n\
             Ghost reports:     {}\n\
             Abandoned posts:   {abandoned}\n\
             Hosts:             {}\n\
             Records:           {}\n",
            counters.messages,
            counters.dropped,
            counters.unauthorized,
            counters.ghosts,
            self.store.host_count(),
            self.store.record_count(),
        );
        let report = StatusReport {
            host,
            test: SELF_TEST.to_string(),
            color,
            message,
            lifetime_mins: None,
            group: None,
            client_ts: None,
        };
        match self.store.apply_report(&report, INTERNAL_SENDER, now_secs()) {
            Ok(postings) => self.publish(postings).await,
            Err(e) => warn!("self status not recorded: {e}"),
        }
    }
}

/// Handle for talking to a running BoardActor
#[derive(Clone)]
pub struct BoardHandle {
    sender: mpsc::Sender<BoardCommand>,
}

impl BoardHandle {
    /// Spawn the actor and return a handle to it.
    pub fn spawn(actor: BoardActor) -> Self {
        let handle = actor.handle();
        tokio::spawn(actor.run());
        handle
    }

    /// Submit one client message and wait for the reply.
    pub async fn submit(&self, text: String, sender: IpAddr) -> BoardResult<Option<String>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(BoardCommand::Message {
                text,
                sender,
                respond_to: tx,
            })
            .await
            .map_err(|_| BoardError::ChannelClosed("board"))?;
        rx.await.map_err(|_| BoardError::ChannelClosed("board"))
    }

    pub async fn rejected(&self) {
        let _ = self.sender.send(BoardCommand::Rejected).await;
    }

    pub async fn reload_hosts(&self, hosts: Vec<HostConfig>) {
        let _ = self.sender.send(BoardCommand::ReloadHosts { hosts }).await;
    }

    pub async fn stats(&self) -> Option<BoardStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(BoardCommand::Stats { respond_to: tx })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Stop the actor and wait until its final checkpoint is written.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(BoardCommand::Shutdown { done: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }
}
