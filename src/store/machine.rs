//! The per-record state machine
//!
//! Every report, modifier update, disable and staleness transition runs
//! through [`apply`]. Evaluation order:
//!
//! ```text
//! modifiers ─► flap check ─► disable (until OK / timed) ─► ack expiry
//!     ─► validity ─► cookie ─► stachg ─► page ─► status
//! ```
//!
//! The function mutates the record in place and returns the channel
//! postings in the order they must be published.

use tracing::{debug, warn};

use crate::channel::Posting;
use crate::color::Color;
use crate::config::StoreConfig;

use super::cookie::CookieJar;
use super::events::{self, RecordView};
use super::host::{HostId, HostMeta, RecordKey};
use super::record::{DisableUntil, LogRecord};

/// Sender name used for updates the store makes on its own
pub const INTERNAL_SENDER: &str = "boardwatchd";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// A status report from an agent (or the staleness sweep)
    Report,
    /// Only the modifier set changed; timing is left alone
    Modify,
    /// Re-run after an enable/disable command
    Reevaluate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Ok,
    Alert,
    Undecided,
}

pub fn alert_level(config: &StoreConfig, color: Color) -> AlertLevel {
    if config.alert_colors.contains(color) {
        AlertLevel::Alert
    } else if config.ok_colors.contains(color) {
        AlertLevel::Ok
    } else {
        AlertLevel::Undecided
    }
}

/// One input to the state machine
#[derive(Debug, Clone)]
pub struct Incoming<'a> {
    pub color: Color,
    pub message: Option<&'a str>,
    pub sender: &'a str,
    pub validity_mins: Option<i64>,
    pub group: Option<&'a str>,
    pub testflags: Option<String>,
    pub client_ts: Option<i64>,
    pub mode: UpdateMode,
}

impl<'a> Incoming<'a> {
    pub fn report(color: Color, message: &'a str, sender: &'a str) -> Self {
        Self {
            color,
            message: Some(message),
            sender,
            validity_mins: None,
            group: None,
            testflags: None,
            client_ts: None,
            mode: UpdateMode::Report,
        }
    }

    pub fn reevaluate(color: Color, sender: &'a str) -> Self {
        Self {
            color,
            message: None,
            sender,
            validity_mins: None,
            group: None,
            testflags: None,
            client_ts: None,
            mode: UpdateMode::Reevaluate,
        }
    }

    pub fn modify(sender: &'a str) -> Self {
        Self {
            mode: UpdateMode::Modify,
            ..Self::reevaluate(Color::Clear, sender)
        }
    }
}

/// Borrowed context for one state machine run
pub(crate) struct Machine<'a> {
    pub config: &'a StoreConfig,
    pub cookies: &'a mut CookieJar,
    pub host_id: HostId,
    pub host: &'a HostMeta,
    pub key: &'a RecordKey,
    pub test: &'a str,
}

impl Machine<'_> {
    pub fn apply(&mut self, record: &mut LogRecord, incoming: &Incoming<'_>, now: i64) -> Vec<Posting> {
        apply(self, record, incoming, now)
    }
}

fn apply(
    machine: &mut Machine<'_>,
    record: &mut LogRecord,
    incoming: &Incoming<'_>,
    now: i64,
) -> Vec<Posting> {
    let config = machine.config;
    let mut postings = Vec::new();
    let old_level = alert_level(config, record.color);

    let mut new_color = match incoming.mode {
        UpdateMode::Modify => record.reported_color,
        UpdateMode::Report => {
            record.reported_color = incoming.color;
            incoming.color
        }
        UpdateMode::Reevaluate => incoming.color,
    };

    // modifiers decay by one report
    if incoming.mode == UpdateMode::Report {
        for modifier in record.modifiers.iter_mut() {
            modifier.remaining = modifier.remaining.saturating_sub(1);
        }
        record.modifiers.retain(|m| m.remaining > 0);
    }
    if let Some(worst) = record.modifiers.iter().map(|m| m.color).max() {
        new_color = worst;
    }

    if incoming.mode == UpdateMode::Report {
        check_flapping(machine, record, &mut new_color, now);
    }

    // disables
    match record.disable.as_ref().map(|d| d.until) {
        Some(DisableUntil::Recovery) => {
            if new_color != Color::Blue && alert_level(config, new_color) == AlertLevel::Ok {
                debug!("{}.{} recovered, clearing disable", machine.host.name, machine.test);
                record.disable = None;
                postings.push(events::enadis(&view(machine, record, incoming.sender)));
            } else {
                new_color = Color::Blue;
            }
        }
        Some(DisableUntil::Time(until)) if until > now => new_color = Color::Blue,
        Some(DisableUntil::Time(_)) => {
            debug!("{}.{} disable expired", machine.host.name, machine.test);
            record.disable = None;
            postings.push(events::enadis(&view(machine, record, incoming.sender)));
        }
        None => {}
    }

    // acks end on recovery or expiry
    if let Some(ack) = &record.ack {
        if alert_level(config, new_color) == AlertLevel::Ok || ack.until <= now {
            record.ack = None;
        }
    }

    match incoming.mode {
        UpdateMode::Report => {
            let validity = incoming
                .validity_mins
                .unwrap_or(config.default_validity_mins);
            record.log_time = now;
            record.valid_until = now + validity * 60;
            record.cover_deadlines();

            if !record.sender.is_empty()
                && record.sender != incoming.sender
                && record.sender != INTERNAL_SENDER
                && incoming.sender != INTERNAL_SENDER
            {
                warn!(
                    "{}.{} sender changed from {} to {}",
                    machine.host.name, machine.test, record.sender, incoming.sender
                );
            }
            record.sender = incoming.sender.to_string();
            if let Some(message) = incoming.message {
                record.message = message.to_string();
            }
            if incoming.group.is_some() {
                record.group = incoming.group.map(str::to_string);
            }
            record.testflags = incoming.testflags.clone();
            record.client_ts = incoming.client_ts;
        }
        UpdateMode::Reevaluate => record.cover_deadlines(),
        UpdateMode::Modify => {}
    }

    record.old_color = record.color;
    record.color = new_color;
    let new_level = alert_level(config, new_color);

    // cookies live exactly as long as the alert
    if new_level == AlertLevel::Alert {
        let expired = record.cookie.is_none_or(|c| c.expires < now);
        if expired {
            if let Some(old) = record.cookie.take() {
                machine.cookies.revoke(old.value);
            }
            let value = machine.cookies.issue(machine.host_id, machine.key.clone());
            record.cookie = Some(super::record::Cookie {
                value,
                expires: now + config.cookie_lifetime_secs,
            });
        }
    } else if let Some(old) = record.cookie.take() {
        machine.cookies.revoke(old.value);
    }

    let changed = record.old_color != new_color;
    if !record.history_synced || changed {
        postings.push(events::stachg(&view(machine, record, incoming.sender)));
        record.history_synced = true;
        if changed {
            record.flap.push(now);
            record.last_change = now;
            record.change_count += 1;
        }
    }

    if new_level == AlertLevel::Alert {
        record.alert_active = true;
        postings.push(events::page(&view(machine, record, incoming.sender)));
    } else if record.alert_active && old_level != AlertLevel::Ok && new_level == AlertLevel::Ok {
        record.alert_active = false;
        postings.push(events::page(&view(machine, record, incoming.sender)));
    } else if record.alert_active && changed {
        postings.push(events::page(&view(machine, record, incoming.sender)));
    }

    postings.push(events::status(&view(machine, record, incoming.sender)));
    postings
}

/// Keep the worst color while a record flaps. A suppressed change still
/// counts as a change for the ring and the change counter.
fn check_flapping(machine: &Machine<'_>, record: &mut LogRecord, new_color: &mut Color, now: i64) {
    let config = machine.config;
    if config.flap_count == 0 || !record.flap.is_flapping(now, config.flap_threshold_secs) {
        record.flapping = false;
        return;
    }

    if record.flapping {
        record.old_flap_color = record.curr_flap_color;
    } else {
        warn!(
            "flapping detected for {}.{}: {} changes in {}s",
            machine.host.name,
            machine.test,
            config.flap_count,
            record.flap.span(now).unwrap_or_default()
        );
        record.flapping = true;
        record.old_flap_color = record.color;
    }
    record.curr_flap_color = *new_color;

    if *new_color < record.color {
        *new_color = record.color;
    }

    if record.old_flap_color != record.curr_flap_color && *new_color == record.color {
        record.flap.push(now);
        record.change_count += 1;
    }
}

fn view<'a>(machine: &'a Machine<'_>, record: &'a LogRecord, sender: &'a str) -> RecordView<'a> {
    RecordView {
        host: machine.host,
        test: machine.test,
        record,
        sender,
    }
}
