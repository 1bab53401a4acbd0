//! Criteria matching for alert rules and recipients
//!
//! The checks run in a fixed order and the first failing check ends the
//! evaluation. Two of them only make sense once a recipient is tested
//! against its rule: whether a notice should be sent, and whether a
//! recovery should be sent. At rule level both pass.

use chrono::NaiveDateTime;
use regex::Regex;

use crate::color::{Color, ColorSet};
use crate::error::{BoardError, BoardResult};

use super::timespec::TimeSpec;
use super::tracker::{ActiveAlert, AlertState};

/// Matches a name either against a regex (`%pattern`) or a list of names
#[derive(Debug, Clone)]
pub enum NamePattern {
    Regex(Regex),
    List(Vec<String>),
}

impl NamePattern {
    pub fn parse(spec: &str) -> BoardResult<Self> {
        if let Some(pattern) = spec.strip_prefix('%') {
            let regex = Regex::new(&format!("(?i){pattern}"))
                .map_err(|e| BoardError::Config(format!("bad pattern '{pattern}': {e}")))?;
            return Ok(NamePattern::Regex(regex));
        }
        Ok(NamePattern::List(
            spec.split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect(),
        ))
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            NamePattern::Regex(regex) => regex.is_match(name),
            NamePattern::List(names) => names.iter().any(|n| n == "*" || n == name),
        }
    }
}

impl PartialEq for NamePattern {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (NamePattern::Regex(a), NamePattern::Regex(b)) => a.as_str() == b.as_str(),
            (NamePattern::List(a), NamePattern::List(b)) => a == b,
            _ => false,
        }
    }
}

/// An include/exclude pair for one dimension
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub include: Option<NamePattern>,
    pub exclude: Option<NamePattern>,
}

impl Filter {
    fn is_set(&self) -> bool {
        self.include.is_some() || self.exclude.is_some()
    }

    fn allows(&self, name: &str) -> bool {
        self.include.as_ref().is_none_or(|p| p.matches(name))
            && !self.exclude.as_ref().is_some_and(|p| p.matches(name))
    }

    /// Like [`Filter::allows`] for an entity known under several names: the
    /// include passes if any name matches, the exclude fails if any name does.
    fn allows_any<'a>(&self, mut names: impl Iterator<Item = &'a str> + Clone) -> bool {
        let included = self
            .include
            .as_ref()
            .is_none_or(|p| names.clone().any(|n| p.matches(n)));
        let excluded = self
            .exclude
            .as_ref()
            .is_some_and(|p| names.any(|n| p.matches(n)));
        included && !excluded
    }
}

/// The set of filters attached to a rule or a recipient
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Criteria {
    /// Rules-file line the criteria were defined on
    pub cfid: usize,
    pub page: Filter,
    pub display_group: Filter,
    pub host: Filter,
    pub service: Filter,
    pub class: Filter,
    pub group: Filter,
    pub colors: Option<ColorSet>,
    pub time: Option<TimeSpec>,
    pub extime: Option<TimeSpec>,
    /// Seconds the problem must have lasted
    pub min_duration: Option<i64>,
    /// Seconds after which the problem no longer alerts
    pub max_duration: Option<i64>,
    pub recovered: Option<bool>,
    pub notice: Option<bool>,
}

/// Wall clock for one evaluation
#[derive(Debug, Clone)]
pub struct MatchContext {
    pub now: i64,
    /// Local time, for time-of-day windows
    pub local: NaiveDateTime,
    /// Colors matched when a criteria set has no `COLOR=`
    pub default_colors: ColorSet,
}

impl MatchContext {
    pub fn new(now: i64, default_colors: ColorSet) -> Self {
        let local = chrono::DateTime::from_timestamp(now, 0)
            .map(|utc| utc.with_timezone(&chrono::Local).naive_local())
            .unwrap_or_default();
        Self {
            now,
            local,
            default_colors,
        }
    }
}

/// Side results of matching, accumulated across calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchNotes {
    /// A rule or recipient passed every name filter, so the alert is not
    /// orphaned
    pub any_match: bool,
    /// Earliest time a currently failing check might pass
    pub retry_at: Option<i64>,
}

impl MatchNotes {
    fn retry(&mut self, at: i64) {
        self.retry_at = Some(self.retry_at.map_or(at, |t| t.min(at)));
    }
}

/// Evaluate `crit` against an alert. `rule` is set when `crit` belongs to a
/// recipient of that rule.
pub fn matches(
    alert: &ActiveAlert,
    crit: &Criteria,
    rule: Option<&Criteria>,
    ctx: &MatchContext,
    notes: &mut MatchNotes,
) -> bool {
    let duration = ctx.now - alert.event_start;

    if alert.state == AlertState::Paging && crit.max_duration.is_some_and(|max| duration > max) {
        return false;
    }

    if !crit.class.allows(alert.class.as_deref().unwrap_or("")) {
        return false;
    }

    // recovery messages carry no group list
    if crit.group.is_set() && alert.state != AlertState::Recovered {
        let groups = alert.groups.split(',').filter(|g| !g.is_empty());
        let has_groups = groups.clone().next().is_some();
        if crit.group.include.is_some() && !has_groups {
            return false;
        }
        if has_groups && !crit.group.allows_any(groups) {
            return false;
        }
    }

    let location = if alert.location.is_empty() {
        "/"
    } else {
        alert.location.as_str()
    };
    if !crit.page.allows_any(location.split(',')) {
        return false;
    }

    if !crit
        .display_group
        .allows(alert.display_group.as_deref().unwrap_or(""))
    {
        return false;
    }
    if !crit.host.allows(&alert.host) || !crit.service.allows(&alert.test) {
        return false;
    }

    if alert.state == AlertState::Notify {
        return match rule {
            Some(rule) => crit.notice.unwrap_or(rule.notice == Some(true)),
            None => true,
        };
    }

    notes.any_match = true;

    if alert.state == AlertState::Paging {
        if let Some(min) = crit.min_duration {
            if duration < min {
                notes.retry(alert.event_start + min);
                return false;
            }
        }
    }

    let outside_time = crit.time.as_ref().is_some_and(|t| !t.contains(&ctx.local))
        || crit.extime.as_ref().is_some_and(|t| t.contains(&ctx.local));
    if outside_time {
        notes.retry(ctx.now + 60);
        return false;
    }

    let colors = crit
        .colors
        .or_else(|| rule.and_then(|r| r.colors))
        .unwrap_or(ctx.default_colors);
    if !colors.contains(alert.color) {
        return false;
    }

    if matches!(alert.state, AlertState::Recovered | AlertState::Disabled) {
        if let Some(rule) = rule {
            return crit.recovered.unwrap_or(rule.recovered == Some(true));
        }
    }
    true
}

/// Default colors minus the negated entries of a `!`-prefixed list, or the
/// union of a plain list.
pub fn parse_colors(spec: &str, defaults: ColorSet) -> BoardResult<ColorSet> {
    let mut colors = if spec.starts_with('!') {
        defaults
    } else {
        ColorSet::empty()
    };
    for item in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match item.strip_prefix('!') {
            Some(name) => colors.remove(name.parse::<Color>()?),
            None => colors.insert(item.parse::<Color>()?),
        }
    }
    Ok(colors)
}
