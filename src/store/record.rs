use crate::color::Color;
use crate::util::nlencode;

use super::flap::FlapRing;
use super::host::TestId;

/// Validity used for records that stay valid until something changes them
pub const FOREVER: i64 = i64::MAX;

/// A temporary color override installed by another subsystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modifier {
    pub source: String,
    pub color: Color,
    pub cause: String,
    /// Reports left before the modifier expires
    pub remaining: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub until: i64,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableUntil {
    Time(i64),
    /// Disabled until the next healthy report
    Recovery,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disable {
    pub until: DisableUntil,
    pub message: String,
}

impl Disable {
    /// Wire representation: `-1` for "until recovered", otherwise the deadline.
    pub fn enable_time(&self) -> i64 {
        match self.until {
            DisableUntil::Time(t) => t,
            DisableUntil::Recovery => -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cookie {
    pub value: u32,
    pub expires: i64,
}

/// State of one host/test/origin triple
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub test: TestId,
    pub origin: String,

    pub color: Color,
    pub old_color: Color,
    /// Color of the last agent report before any override
    pub reported_color: Color,

    pub flap: FlapRing,
    pub flapping: bool,
    pub(crate) old_flap_color: Color,
    pub(crate) curr_flap_color: Color,

    pub modifiers: Vec<Modifier>,

    pub testflags: Option<String>,
    pub message: String,
    pub sender: String,
    pub group: Option<String>,
    pub client_ts: Option<i64>,

    pub log_time: i64,
    pub last_change: i64,
    pub valid_until: i64,

    pub ack: Option<Ack>,
    pub disable: Option<Disable>,
    pub cookie: Option<Cookie>,

    pub alert_active: bool,
    pub change_count: u64,
    /// The current color has been reported on the stachg channel
    pub history_synced: bool,
}

impl LogRecord {
    pub fn new(test: TestId, origin: impl Into<String>, flap_count: usize, now: i64) -> Self {
        Self {
            test,
            origin: origin.into(),
            color: Color::Clear,
            old_color: Color::Clear,
            reported_color: Color::Clear,
            flap: FlapRing::new(flap_count),
            flapping: false,
            old_flap_color: Color::Clear,
            curr_flap_color: Color::Clear,
            modifiers: Vec::new(),
            testflags: None,
            message: String::new(),
            sender: String::new(),
            group: None,
            client_ts: None,
            log_time: now,
            last_change: now,
            valid_until: now,
            ack: None,
            disable: None,
            cookie: None,
            alert_active: false,
            change_count: 0,
            history_synced: false,
        }
    }

    pub fn ack_time(&self) -> i64 {
        self.ack.as_ref().map_or(0, |a| a.until)
    }

    pub fn ack_message(&self) -> &str {
        self.ack.as_ref().map_or("", |a| a.message.as_str())
    }

    pub fn enable_time(&self) -> i64 {
        self.disable.as_ref().map_or(0, Disable::enable_time)
    }

    pub fn disable_message(&self) -> &str {
        self.disable.as_ref().map_or("", |d| d.message.as_str())
    }

    pub fn cookie_value(&self) -> Option<u32> {
        self.cookie.map(|c| c.value)
    }

    pub fn first_line(&self) -> &str {
        self.message.lines().next().unwrap_or_default()
    }

    /// Modifier causes, encoded for a single channel field
    pub fn modifier_summary(&self) -> String {
        let causes: Vec<&str> = self.modifiers.iter().map(|m| m.cause.as_str()).collect();
        nlencode(&causes.join("\n"))
    }

    /// Raise the validity so it covers any ack or disable deadline.
    pub fn cover_deadlines(&mut self) {
        if let Some(ack) = &self.ack {
            self.valid_until = self.valid_until.max(ack.until);
        }
        match self.disable.as_ref().map(|d| d.until) {
            Some(DisableUntil::Recovery) => self.valid_until = FOREVER,
            Some(DisableUntil::Time(t)) => self.valid_until = self.valid_until.max(t),
            None => {}
        }
    }
}

/// Extract `[flags:xyz]` from the first line of a status message.
pub fn parse_testflags(message: &str) -> Option<String> {
    let first = message.lines().next()?;
    let start = first.find("[flags:")? + "[flags:".len();
    let end = first[start..].find(']')?;
    Some(first[start..start + end].to_string())
}
