//! Alerter - turns page-channel traffic into notifications
//!
//! ## Message Flow
//!
//! ```text
//! stdin ─► reader task ─► mpsc ─► Alerter ─► AlertTracker ─► pass ─► Dispatcher
//!                                    │                                 (mail / script)
//!                                    └── rules file (reloaded when it changes)
//! ```
//!
//! The alerter runs as a child process of a fanout worker on the page
//! channel. It keeps its alert table in memory, checkpoints it
//! periodically and on exit, and picks it up again at start.

pub mod checkpoint;
pub mod criteria;
pub mod notify;
pub mod router;
pub mod rules;
pub mod timespec;
pub mod tracker;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::io::AsyncBufRead;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, interval};
use tracing::{debug, info, instrument, trace, warn};

use crate::channel::ChannelMessage;
use crate::channel::message::read_message;
use crate::color::Color;
use crate::config::AlerterConfig;
use crate::error::BoardResult;
use crate::util::now_secs;

pub use criteria::{Criteria, MatchContext};
pub use notify::{CommandDispatcher, Dispatcher, Notification};
pub use rules::{Format, Method, Recipient, Rule, RuleDefaults, RuleSet};
pub use tracker::{ActiveAlert, AlertState, AlertTracker, TrackerEvent};

const TICK: Duration = Duration::from_secs(1);

pub struct Alerter {
    config: AlerterConfig,
    defaults: RuleDefaults,
    rules: RuleSet,
    rules_mtime: Option<SystemTime>,
    /// Set when the rules were reloaded since the last pass
    rules_changed: bool,
    tracker: AlertTracker,
    dispatcher: Arc<dyn Dispatcher>,
    deliveries: JoinSet<()>,
    last_pass: Option<Instant>,
    last_checkpoint: Instant,
}

/// Repeat interval and alert colors for recipients that set neither
pub fn rule_defaults(config: &AlerterConfig) -> RuleDefaults {
    RuleDefaults {
        repeat_secs: config.default_repeat_mins * 60,
        colors: config.alert_colors,
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl Alerter {
    /// Load the rules and any checkpoint left by a previous run.
    pub fn new(config: AlerterConfig, dispatcher: Arc<dyn Dispatcher>) -> BoardResult<Self> {
        let defaults = rule_defaults(&config);
        let rules = RuleSet::load(&config.rules, &defaults)?;
        info!("loaded {} alert rules from {}", rules.len(), config.rules.display());

        let mut tracker = AlertTracker::new(config.alert_colors);
        if let Some(path) = &config.checkpoint {
            checkpoint::load(&mut tracker, path, now_secs())?;
        }

        Ok(Self {
            rules_mtime: modified(&config.rules),
            rules_changed: false,
            defaults,
            rules,
            tracker,
            dispatcher,
            deliveries: JoinSet::new(),
            last_pass: None,
            last_checkpoint: Instant::now(),
            config,
        })
    }

    pub fn tracker(&self) -> &AlertTracker {
        &self.tracker
    }

    /// Process the page channel from `input` until it ends or a shutdown
    /// message arrives.
    #[instrument(skip_all)]
    pub async fn run<R>(mut self, input: R)
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<String>(256);
        tokio::spawn(async move {
            let mut input = input;
            loop {
                match read_message(&mut input).await {
                    Ok(Some(text)) => {
                        if tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("reading page channel failed: {e}");
                        break;
                    }
                }
            }
        });

        let mut ticker = interval(TICK);
        loop {
            tokio::select! {
                text = rx.recv() => {
                    let Some(text) = text else {
                        debug!("page channel closed");
                        break;
                    };
                    if self.handle_message(&text) == TrackerEvent::Shutdown {
                        info!("shutdown requested");
                        break;
                    }
                    self.maybe_pass();
                }

                _ = ticker.tick() => {
                    self.maybe_pass();
                    self.maybe_checkpoint();
                    while self.deliveries.try_join_next().is_some() {}
                }
            }
        }

        self.finish().await;
    }

    fn handle_message(&mut self, text: &str) -> TrackerEvent {
        let msg = match ChannelMessage::decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("undecodable page message: {e}");
                return TrackerEvent::Continue;
            }
        };
        trace!(marker = %msg.marker, seq = msg.seq, "page message");
        let ctx = MatchContext::new(now_secs(), self.config.alert_colors);
        let event = self.tracker.handle(&msg, &self.rules, &ctx);
        if event == TrackerEvent::Reload {
            self.reload_rules(true);
        }
        event
    }

    /// Reload the rules if forced or the file changed on disk.
    fn reload_rules(&mut self, force: bool) {
        let mtime = modified(&self.config.rules);
        if !force && mtime == self.rules_mtime {
            return;
        }
        match RuleSet::load(&self.config.rules, &self.defaults) {
            Ok(rules) => {
                info!("reloaded {} alert rules", rules.len());
                self.rules = rules;
                self.rules_mtime = mtime;
                self.rules_changed = true;
            }
            Err(e) => warn!("keeping previous alert rules: {e}"),
        }
    }

    fn maybe_pass(&mut self) {
        let interval = Duration::from_secs(self.config.pass_interval_secs);
        if self.last_pass.is_some_and(|at| at.elapsed() < interval) {
            return;
        }
        self.last_pass = Some(Instant::now());
        self.reload_rules(false);

        let ctx = MatchContext::new(now_secs(), self.config.alert_colors);
        let notifications = self.tracker.pass(&self.rules, &ctx, self.rules_changed);
        self.rules_changed = false;

        for notification in notifications {
            let dispatcher = Arc::clone(&self.dispatcher);
            self.deliveries.spawn(async move {
                let (host, test) = (notification.host.clone(), notification.test.clone());
                if let Err(e) = dispatcher.dispatch(notification).await {
                    warn!(host, test, "notification failed: {e}");
                }
            });
        }
    }

    fn maybe_checkpoint(&mut self) {
        let Some(path) = self.config.checkpoint.clone() else {
            return;
        };
        let every = Duration::from_secs(self.config.checkpoint_interval_secs);
        if self.last_checkpoint.elapsed() < every {
            return;
        }
        self.last_checkpoint = Instant::now();
        let alerts = self.tracker.checkpoint_text();
        let repeats = self.tracker.repeats_text();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = checkpoint::write_files(&path, &alerts, &repeats) {
                warn!("alert checkpoint failed: {e}");
            }
        });
    }

    async fn finish(&mut self) {
        while self.deliveries.join_next().await.is_some() {}
        if let Some(path) = &self.config.checkpoint {
            if let Err(e) = checkpoint::save(&self.tracker, path) {
                warn!("final alert checkpoint failed: {e}");
            }
        }
        debug!("alerter stopped");
    }
}

/// Describe who would be notified about `host.test` going `color`
/// `duration_secs` ago, one line per recipient.
pub fn dry_run(
    rules: &RuleSet,
    host: &str,
    test: &str,
    color: Color,
    duration_secs: i64,
    ctx: &MatchContext,
) -> Vec<String> {
    let mut alert = ActiveAlert::new(host, test, ctx.now - duration_secs);
    alert.state = AlertState::Paging;
    alert.color = color;
    alert.max_color = color;
    router::recipients(rules, &alert, ctx)
        .into_iter()
        .map(|(rule, recipient)| format!("rule {}: {recipient}", rule.cfid))
        .collect()
}
