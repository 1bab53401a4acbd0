//! Alert state tracking
//!
//! ## States
//!
//! ```text
//!            page (alert color)                ack
//!   (new) ───────────────────────► PAGING ─────────────► ACKED
//!                                   │  ▲  ◄───────────────┘
//!            no rule matches at all │  │ rules changed     ack expired
//!                                   ▼  │
//!                                 NORECIP
//!
//!   page (OK color) ──► RECOVERED ─┐
//!   page (blue)     ──► DISABLED  ─┼── one pass ──► DEAD ──► removed
//!   notify          ──► NOTIFY    ─┘
//!   drop / rename   ──────────────────────────────► DEAD
//! ```
//!
//! The tracker keeps a repeat table with the time each recipient may next
//! be notified about an alert. Entries are keyed
//! `host|test|method|recipient`.

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, info, trace};

use crate::channel::ChannelMessage;
use crate::color::{Color, ColorSet};
use crate::util::nldecode;

use super::criteria::{MatchContext, MatchNotes};
use super::notify::Notification;
use super::router::{RecipientCursor, have_recipient, recipients};
use super::rules::{Method, RuleSet};

/// Without any recipient-specific deadline the next look is this far out
const IDLE_RECHECK_SECS: i64 = 30 * 86400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertState {
    Paging,
    NoRecip,
    Acked,
    Recovered,
    Disabled,
    Notify,
    Dead,
}

impl AlertState {
    pub fn name(self) -> &'static str {
        match self {
            AlertState::Paging => "paging",
            AlertState::NoRecip => "norecip",
            AlertState::Acked => "acked",
            AlertState::Recovered => "recovered",
            AlertState::Disabled => "disabled",
            AlertState::Notify => "notify",
            AlertState::Dead => "dead",
        }
    }

    pub fn parse(name: &str) -> Option<AlertState> {
        [
            AlertState::Paging,
            AlertState::NoRecip,
            AlertState::Acked,
            AlertState::Recovered,
            AlertState::Disabled,
            AlertState::Notify,
            AlertState::Dead,
        ]
        .into_iter()
        .find(|s| s.name() == name)
    }
}

impl fmt::Display for AlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One tracked alert (or notice)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveAlert {
    pub host: String,
    pub test: String,
    /// Comma-separated page paths of the host
    pub location: String,
    pub ip: String,
    pub color: Color,
    /// Worst color seen during this event
    pub max_color: Color,
    pub event_start: i64,
    pub next_alert_time: i64,
    pub state: AlertState,
    pub page_message: String,
    pub ack_message: Option<String>,
    /// `-1` when the status holds no cookie
    pub cookie: i64,
    pub class: Option<String>,
    /// Comma-separated alert groups
    pub groups: String,
    pub display_group: Option<String>,
}

impl ActiveAlert {
    pub fn new(host: &str, test: &str, event_start: i64) -> Self {
        Self {
            host: host.to_string(),
            test: test.to_string(),
            location: String::new(),
            ip: String::new(),
            color: Color::Green,
            max_color: Color::Green,
            event_start,
            next_alert_time: 0,
            state: AlertState::Dead,
            page_message: String::new(),
            ack_message: None,
            cookie: -1,
            class: None,
            groups: String::new(),
            display_group: None,
        }
    }

    fn is(&self, host: &str, test: &str) -> bool {
        self.host == host && self.test == test
    }
}

/// What the alerter loop should do after a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    Continue,
    Reload,
    Shutdown,
}

#[derive(Debug)]
pub struct AlertTracker {
    pub(super) alerts: Vec<ActiveAlert>,
    /// Next permitted notification per recipient and alert
    pub(super) repeats: BTreeMap<String, i64>,
    alert_colors: ColorSet,
}

fn non_empty(field: Option<&str>) -> Option<String> {
    field.filter(|f| !f.is_empty()).map(str::to_string)
}

impl AlertTracker {
    pub fn new(alert_colors: ColorSet) -> Self {
        Self {
            alerts: Vec::new(),
            repeats: BTreeMap::new(),
            alert_colors,
        }
    }

    pub fn alerts(&self) -> &[ActiveAlert] {
        &self.alerts
    }

    /// The alert for a host/test, ignoring notices.
    pub fn get(&self, host: &str, test: &str) -> Option<&ActiveAlert> {
        self.alerts
            .iter()
            .find(|a| a.is(host, test) && a.state != AlertState::Notify)
    }

    pub fn next_repeat(&self, key: &str) -> Option<i64> {
        self.repeats.get(key).copied()
    }

    fn find_mut(&mut self, host: &str, test: &str) -> Option<&mut ActiveAlert> {
        self.alerts
            .iter_mut()
            .find(|a| a.is(host, test) && a.state != AlertState::Notify)
    }

    /// Apply one page-channel message.
    pub fn handle(
        &mut self,
        msg: &ChannelMessage,
        rules: &RuleSet,
        ctx: &MatchContext,
    ) -> TrackerEvent {
        let host = msg.field(0).unwrap_or_default();
        let test = msg.field(1).unwrap_or_default();
        match msg.marker.as_str() {
            "page" => self.on_page(msg, rules, ctx),
            "ack" => {
                let until = msg.field(3).and_then(|t| t.parse().ok()).unwrap_or(ctx.now);
                match self.find_mut(host, test) {
                    Some(alert) if alert.state == AlertState::Paging => {
                        debug!(host, test, until, "alert acknowledged");
                        alert.state = AlertState::Acked;
                        alert.next_alert_time = until;
                        alert.ack_message = Some(msg.body.clone());
                    }
                    _ => trace!(host, test, "ack for an alert that is not paging"),
                }
            }
            "notify" => {
                let mut notice = ActiveAlert::new(host, test, ctx.now);
                notice.location = msg.field(2).unwrap_or_default().to_string();
                notice.page_message = msg.body.clone();
                notice.state = AlertState::Notify;
                self.alerts.push(notice);
            }
            "drophost" | "dropstate" | "renamehost" => {
                for alert in self.alerts.iter_mut().filter(|a| a.host == host) {
                    alert.state = AlertState::Dead;
                }
            }
            "droptest" | "renametest" => {
                if let Some(alert) = self.find_mut(host, test) {
                    alert.state = AlertState::Dead;
                }
            }
            "shutdown" => return TrackerEvent::Shutdown,
            "reload" => return TrackerEvent::Reload,
            other => trace!("ignoring {other} message"),
        }
        TrackerEvent::Continue
    }

    fn on_page(&mut self, msg: &ChannelMessage, rules: &RuleSet, ctx: &MatchContext) {
        let host = msg.field(0).unwrap_or_default();
        let test = msg.field(1).unwrap_or_default();
        let Some(new_color) = msg.field(4).and_then(Color::parse) else {
            debug!(host, test, "page without a valid color");
            return;
        };

        let index = match self
            .alerts
            .iter()
            .position(|a| a.is(host, test) && a.state != AlertState::Notify)
        {
            Some(index) => index,
            None => {
                // the status change time keeps durations right across restarts
                let start = msg.field(6).and_then(|t| t.parse().ok()).unwrap_or(ctx.now);
                self.alerts.push(ActiveAlert::new(host, test, start));
                self.alerts.len() - 1
            }
        };
        let alert_colors = self.alert_colors;
        let alert = &mut self.alerts[index];
        let repeats = &mut self.repeats;

        let was_alerting = alert_colors.contains(alert.color);
        let alerting = alert_colors.contains(new_color);
        trace!(host, test, was_alerting, alerting, "page");

        if alerting {
            alert.color = new_color;
            alert.state = AlertState::Paging;
            if new_color > alert.max_color {
                if alert.max_color != Color::Green {
                    debug!(host, test, "severity increased to {new_color}");
                    clear_interval(alert, rules, ctx, repeats);
                }
                alert.max_color = new_color;
            }
        } else {
            // the color stays, recoveries go to whoever got the alert
            alert.state = if new_color == Color::Blue {
                AlertState::Disabled
            } else {
                AlertState::Recovered
            };
        }
        if was_alerting != alerting {
            clear_interval(alert, rules, ctx, repeats);
        }

        alert.ip = msg.field(2).unwrap_or_default().to_string();
        alert.location = msg.field(7).unwrap_or_default().to_string();
        alert.cookie = msg.field(8).and_then(|c| c.parse().ok()).unwrap_or(-1);
        alert.display_group = non_empty(msg.field(9));
        alert.class = non_empty(msg.field(10));
        alert.groups = msg.field(11).unwrap_or_default().to_string();
        alert.page_message = match msg.field(12).filter(|m| !m.is_empty()) {
            Some(modifiers) => format!(
                "{host}:{test} {}\n{}\n{}",
                alert.color,
                nldecode(modifiers),
                msg.body
            ),
            None => msg.body.clone(),
        };
    }

    /// One pass over all alerts: state housekeeping, then the notifications
    /// that are due, then the next alert times. Dead alerts are removed.
    pub fn pass(
        &mut self,
        rules: &RuleSet,
        ctx: &MatchContext,
        config_changed: bool,
    ) -> Vec<Notification> {
        let now = ctx.now;
        let repeats = &mut self.repeats;
        let mut any_due = false;

        for alert in self.alerts.iter_mut() {
            match alert.state {
                AlertState::NoRecip if config_changed => {
                    alert.state = AlertState::Paging;
                    clear_interval(alert, rules, ctx, repeats);
                    any_due |= check_recipients(alert, rules, ctx, repeats);
                }
                AlertState::Paging => any_due |= check_recipients(alert, rules, ctx, repeats),
                AlertState::Acked if alert.next_alert_time <= now => {
                    debug!(host = %alert.host, test = %alert.test, "acknowledgement expired");
                    alert.ack_message = None;
                    alert.state = AlertState::Paging;
                    any_due = true;
                }
                AlertState::Recovered | AlertState::Disabled | AlertState::Notify => any_due = true,
                _ => {}
            }
        }

        let mut out = Vec::new();
        if any_due {
            for alert in &self.alerts {
                let due = match alert.state {
                    AlertState::Paging => alert.next_alert_time <= now,
                    AlertState::Recovered | AlertState::Disabled | AlertState::Notify => true,
                    _ => false,
                };
                if due {
                    out.extend(send_alert(alert, rules, ctx, repeats));
                }
            }
        }

        for alert in self.alerts.iter_mut() {
            match alert.state {
                AlertState::Paging if alert.next_alert_time <= now => {
                    alert.next_alert_time = next_alert(alert, rules, ctx, repeats);
                }
                AlertState::Recovered | AlertState::Disabled => {
                    alert.state = AlertState::Dead;
                    cleanup(repeats, &alert.host, &alert.test);
                }
                AlertState::Notify => alert.state = AlertState::Dead,
                AlertState::Dead => cleanup(repeats, &alert.host, &alert.test),
                _ => {}
            }
        }
        self.alerts.retain(|a| a.state != AlertState::Dead);

        if !out.is_empty() {
            info!("{} notifications due", out.len());
        }
        out
    }
}

/// A paging alert with no recipient, and no rule even close to matching,
/// parks in NORECIP. Returns whether a notification is due.
fn check_recipients(
    alert: &mut ActiveAlert,
    rules: &RuleSet,
    ctx: &MatchContext,
    repeats: &mut BTreeMap<String, i64>,
) -> bool {
    let (found, any_match) = have_recipient(rules, alert, ctx);
    if found {
        return alert.next_alert_time <= ctx.now;
    }
    if !any_match {
        debug!(host = %alert.host, test = %alert.test, "no recipients");
        alert.state = AlertState::NoRecip;
        cleanup(repeats, &alert.host, &alert.test);
    }
    false
}

/// Make the alert go out on the next pass to everybody it matches.
fn clear_interval(
    alert: &mut ActiveAlert,
    rules: &RuleSet,
    ctx: &MatchContext,
    repeats: &mut BTreeMap<String, i64>,
) {
    alert.next_alert_time = 0;
    for (_, recipient) in recipients(rules, alert, ctx) {
        if let Some(next) = repeats.get_mut(&recipient.repeat_key(&alert.host, &alert.test)) {
            *next = 0;
        }
    }
}

fn cleanup(repeats: &mut BTreeMap<String, i64>, host: &str, test: &str) {
    let prefix = format!("{host}|{test}|");
    repeats.retain(|key, _| !key.starts_with(&prefix));
}

fn send_alert(
    alert: &ActiveAlert,
    rules: &RuleSet,
    ctx: &MatchContext,
    repeats: &BTreeMap<String, i64>,
) -> Vec<Notification> {
    let mut cursor = RecipientCursor::new(rules);
    let mut notes = MatchNotes::default();
    let mut sent = Vec::new();
    let mut alert_count = 0;

    while let Some((_, recipient)) = cursor.next(alert, ctx, &mut notes) {
        if recipient.unmatched_only && alert_count > 0 {
            continue;
        }
        let real_alert = matches!(
            alert.state,
            AlertState::Paging | AlertState::Recovered | AlertState::Disabled
        );
        if (recipient.no_alert && real_alert) || recipient.method == Method::Ignore {
            continue;
        }

        let key = recipient.repeat_key(&alert.host, &alert.test);
        match alert.state {
            AlertState::Paging => {
                alert_count += 1;
                if repeats.get(&key).is_some_and(|next| *next > ctx.now) {
                    trace!("{key} not due yet");
                    continue;
                }
            }
            AlertState::Recovered | AlertState::Disabled => {
                // only those who were told about the problem hear it is over
                if !repeats.contains_key(&key) {
                    continue;
                }
                alert_count += 1;
            }
            _ => {}
        }
        sent.push(Notification::build(alert, recipient, ctx.now));
    }
    sent
}

/// Advance the repeat entries that are due; the alert's next look is the
/// earliest of them.
fn next_alert(
    alert: &ActiveAlert,
    rules: &RuleSet,
    ctx: &MatchContext,
    repeats: &mut BTreeMap<String, i64>,
) -> i64 {
    let now = ctx.now;
    let mut next = now + IDLE_RECHECK_SECS;
    let mut found = false;
    let mut cursor = RecipientCursor::new(rules);
    let mut notes = MatchNotes::default();

    while let Some((_, recipient)) = cursor.next(alert, ctx, &mut notes) {
        found = true;
        if recipient.method == Method::Ignore {
            next = next.min(notes.retry_at.unwrap_or(now + 60));
            continue;
        }
        let entry = repeats
            .entry(recipient.repeat_key(&alert.host, &alert.test))
            .or_insert(0);
        if *entry <= now {
            *entry = now + recipient.repeat_secs;
        }
        next = next.min(*entry);
    }

    match notes.retry_at {
        Some(retry) => next.min(retry),
        None if !found => now + 60,
        None => next,
    }
}
