//! Status store
//!
//! Authoritative in-memory state of every host/test/origin triple. The
//! store is a plain single-owner object: every operation takes `now`
//! explicitly and returns the channel postings it produced, leaving the
//! actual publishing to the caller (the board actor).
//!
//! ## Ownership
//!
//! ```text
//! StatusStore
//!  ├── HostRegistry ── Host ── BTreeMap<RecordKey, LogRecord>
//!  │        └── name/alias index → HostId
//!  ├── TestRegistry (interned test names)
//!  ├── CookieJar (live cookie → record)
//!  └── ghost list
//! ```

pub mod board;
pub mod checkpoint;
pub mod cookie;
pub mod events;
pub mod flap;
pub mod host;
pub mod machine;
pub mod record;

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, info, instrument, trace};

use crate::channel::Posting;
use crate::color::Color;
use crate::config::{GhostPolicy, HostConfig, StoreConfig};
use crate::error::{BoardError, BoardResult};

use cookie::CookieJar;
use events::RecordView;
use host::{Host, HostId, HostMeta, HostRegistry, RecordKey, TestRegistry};
use machine::{INTERNAL_SENDER, Incoming, Machine, UpdateMode};
use record::{Ack, Disable, DisableUntil, LogRecord, Modifier, parse_testflags};

pub use board::{BoardField, BoardQuery};
pub use checkpoint::RestoreSummary;

/// Reports a modifier survives before it has to be refreshed
const MODIFIER_VALIDITY: u32 = 2;

/// A parsed `status` message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub host: String,
    pub test: String,
    pub color: Color,
    pub message: String,
    /// Declared lifetime in minutes (`status+30`)
    pub lifetime_mins: Option<i64>,
    pub group: Option<String>,
    pub client_ts: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableDuration {
    Minutes(i64),
    UntilRecovery,
}

/// A report for an unknown host, remembered under the `log` ghost policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GhostEntry {
    pub sender: String,
    pub last_seen: i64,
}

pub struct StatusStore {
    config: StoreConfig,
    hosts: HostRegistry,
    tests: TestRegistry,
    cookies: CookieJar,
    ghosts: BTreeMap<String, GhostEntry>,
}

impl StatusStore {
    pub fn new(config: StoreConfig, hosts: &[HostConfig]) -> Self {
        Self::with_cookies(config, hosts, CookieJar::new())
    }

    pub fn with_cookies(config: StoreConfig, hosts: &[HostConfig], cookies: CookieJar) -> Self {
        let mut store = Self {
            config,
            hosts: HostRegistry::default(),
            tests: TestRegistry::default(),
            cookies,
            ghosts: BTreeMap::new(),
        };
        for host in hosts {
            store.hosts.upsert(HostMeta::from_config(host), &host.aliases);
        }
        store
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn record_count(&self) -> usize {
        self.hosts.iter().map(|h| h.records.len()).sum()
    }

    pub fn live_cookies(&self) -> usize {
        self.cookies.len()
    }

    /// The record for `host.test`, whatever its origin.
    pub fn record(&self, host: &str, test: &str) -> Option<&LogRecord> {
        let test = self.tests.lookup(test)?;
        self.hosts.by_name(host)?.find(test)
    }

    /// Aggregate color of a host.
    pub fn host_color(&self, host: &str) -> Option<Color> {
        self.hosts.by_name(host)?.color()
    }

    pub fn host_meta(&self, host: &str) -> Option<&HostMeta> {
        self.hosts.by_name(host).map(|h| &h.meta)
    }

    /// Apply an agent status report.
    #[instrument(skip(self, report), fields(host = %report.host, test = %report.test))]
    pub fn apply_report(
        &mut self,
        report: &StatusReport,
        sender: &str,
        now: i64,
    ) -> BoardResult<Vec<Posting>> {
        let host_id = self.admit_host(&report.host, sender, now)?;
        let test = self.tests.intern(&report.test);
        let key = RecordKey {
            test,
            origin: self.config.origin.clone(),
        };

        let flap_count = self.config.flap_count;
        let host = self.host_mut(host_id)?;
        host.records
            .entry(key.clone())
            .or_insert_with(|| LogRecord::new(test, key.origin.clone(), flap_count, now));

        let incoming = Incoming {
            color: report.color,
            message: Some(&report.message),
            sender,
            validity_mins: report.lifetime_mins,
            group: report.group.as_deref(),
            testflags: parse_testflags(&report.message),
            client_ts: report.client_ts,
            mode: UpdateMode::Report,
        };
        trace!("applying {} report", report.color);
        self.update(host_id, &key, &incoming, now)
    }

    /// Install or refresh a color modifier and re-evaluate the record.
    #[instrument(skip(self, cause))]
    pub fn modify(
        &mut self,
        host: &str,
        test: &str,
        color: Color,
        source: &str,
        cause: &str,
        sender: &str,
        now: i64,
    ) -> BoardResult<Vec<Posting>> {
        let (host_id, key) = self.locate(host, test)?;
        let record = self.record_mut(host_id, &key)?;
        let cause = format!("&{color} {cause}");
        match record.modifiers.iter_mut().find(|m| m.source == source) {
            Some(modifier) => {
                modifier.color = color;
                modifier.cause = cause;
                modifier.remaining = MODIFIER_VALIDITY;
            }
            None => record.modifiers.push(Modifier {
                source: source.to_string(),
                color,
                cause,
                remaining: MODIFIER_VALIDITY,
            }),
        }
        self.update(host_id, &key, &Incoming::modify(sender), now)
    }

    /// Acknowledge the alert holding `cookie` for `minutes`.
    ///
    /// When `target` names a host/test, the cookie must belong to it.
    #[instrument(skip(self, message))]
    pub fn ack(
        &mut self,
        cookie: u32,
        target: Option<(&str, &str)>,
        minutes: i64,
        message: &str,
        sender: &str,
        now: i64,
    ) -> BoardResult<Vec<Posting>> {
        let (host_id, key) = self
            .cookies
            .lookup(cookie)
            .cloned()
            .ok_or(BoardError::UnknownCookie(cookie))?;
        if let Some((host, test)) = target {
            if self.locate(host, test)? != (host_id, key.clone()) {
                return Err(BoardError::UnknownCookie(cookie));
            }
        }

        let host = self
            .hosts
            .get_mut(host_id)
            .ok_or(BoardError::UnknownCookie(cookie))?;
        let Host { meta, records, .. } = host;
        let record = records
            .get_mut(&key)
            .ok_or(BoardError::UnknownCookie(cookie))?;
        if record.cookie.is_none_or(|c| c.expires < now) {
            return Err(BoardError::UnknownCookie(cookie));
        }

        record.ack = Some(Ack {
            until: now + minutes * 60,
            message: message.to_string(),
        });
        record.cover_deadlines();
        debug!("{}.{} acknowledged for {minutes} minutes", meta.name, self.tests.name(key.test));

        Ok(vec![events::ack(&RecordView {
            host: meta,
            test: self.tests.name(key.test),
            record,
            sender,
        })])
    }

    /// Disable one test, or every test of the host with `*`.
    #[instrument(skip(self, reason))]
    pub fn disable(
        &mut self,
        host: &str,
        test: &str,
        duration: DisableDuration,
        reason: &str,
        sender: &str,
        now: i64,
    ) -> BoardResult<Vec<Posting>> {
        let host_id = self.resolve(host)?;
        let keys = self.keys_matching(host_id, test)?;
        let until = match duration {
            DisableDuration::UntilRecovery => DisableUntil::Recovery,
            // rounded up to the next full minute
            DisableDuration::Minutes(minutes) => DisableUntil::Time((now + minutes * 60 + 59) / 60 * 60),
        };
        let message = if reason.trim().is_empty() {
            "(No reason given)".to_string()
        } else {
            reason.to_string()
        };

        let mut postings = Vec::new();
        for key in keys {
            postings.push(self.with_record_view(host_id, &key, sender, |record| {
                record.disable = Some(Disable {
                    until,
                    message: message.clone(),
                });
                record.cover_deadlines();
            }, events::enadis)?);
            postings.extend(self.update(host_id, &key, &Incoming::reevaluate(Color::Blue, sender), now)?);
        }
        Ok(postings)
    }

    /// Lift a disable from one test, or every test of the host with `*`.
    #[instrument(skip(self))]
    pub fn enable(&mut self, host: &str, test: &str, sender: &str, now: i64) -> BoardResult<Vec<Posting>> {
        let host_id = self.resolve(host)?;
        let keys = self.keys_matching(host_id, test)?;

        let mut postings = Vec::new();
        for key in keys {
            let record = self.record_mut(host_id, &key)?;
            if record.disable.is_none() {
                continue;
            }
            let reported = record.reported_color;
            postings.push(self.with_record_view(host_id, &key, sender, |record| {
                record.disable = None;
            }, events::enadis)?);
            postings.extend(self.update(host_id, &key, &Incoming::reevaluate(reported, sender), now)?);
        }
        Ok(postings)
    }

    /// Forward a free-text notification about a test to the alerter.
    pub fn notify(&self, host: &str, test: &str, message: &str, sender: &str) -> BoardResult<Vec<Posting>> {
        let meta = self.host_meta(host).ok_or_else(|| BoardError::NotFound(host.to_string()))?;
        Ok(vec![events::notify(meta, test, sender, message)])
    }

    /// Forward a `data` message.
    pub fn data(&mut self, host: &str, name: &str, body: &str, sender: &str, now: i64) -> BoardResult<Vec<Posting>> {
        let host_id = self.admit_host(host, sender, now)?;
        let host = self.host_mut(host_id)?;
        Ok(vec![events::data(&host.meta, name, sender, body)])
    }

    #[instrument(skip(self))]
    pub fn drop_host(&mut self, host: &str, sender: &str) -> BoardResult<Vec<Posting>> {
        let host_id = self.resolve(host)?;
        self.cookies.revoke_host(host_id);
        let removed = self
            .hosts
            .remove(host_id)
            .ok_or_else(|| BoardError::NotFound(host.to_string()))?;
        info!("dropped host {} with {} records", removed.meta.name, removed.records.len());
        Ok(vec![events::drop_host(&removed.meta.name, sender)])
    }

    #[instrument(skip(self))]
    pub fn drop_test(&mut self, host: &str, test: &str, sender: &str) -> BoardResult<Vec<Posting>> {
        let (host_id, key) = self.locate(host, test)?;
        let host = self
            .hosts
            .get_mut(host_id)
            .ok_or_else(|| BoardError::NotFound(host.to_string()))?;
        for key in host.keys_for(key.test) {
            if let Some(cookie) = host.records.remove(&key).and_then(|r| r.cookie_value()) {
                self.cookies.revoke(cookie);
            }
        }
        Ok(vec![events::drop_test(&host.meta.name, test, sender)])
    }

    #[instrument(skip(self))]
    pub fn rename_host(&mut self, host: &str, new_name: &str, sender: &str) -> BoardResult<Vec<Posting>> {
        let host_id = self.resolve(host)?;
        let old_name = self.host_mut(host_id)?.meta.name.clone();
        self.hosts.rename(host_id, new_name)?;
        Ok(vec![events::rename_host(&old_name, new_name, sender)])
    }

    #[instrument(skip(self))]
    pub fn rename_test(
        &mut self,
        host: &str,
        test: &str,
        new_test: &str,
        sender: &str,
    ) -> BoardResult<Vec<Posting>> {
        let (host_id, _) = self.locate(host, test)?;
        let old_id = self.tests.intern(test);
        let new_id = self.tests.intern(new_test);
        let host = self
            .hosts
            .get_mut(host_id)
            .ok_or_else(|| BoardError::NotFound(host.to_string()))?;
        if host.find_key(new_id).is_some() {
            return Err(BoardError::Protocol(format!(
                "{}.{new_test} already exists",
                host.meta.name
            )));
        }
        for key in host.keys_for(old_id) {
            if let Some(mut record) = host.records.remove(&key) {
                let new_key = RecordKey {
                    test: new_id,
                    origin: key.origin.clone(),
                };
                record.test = new_id;
                if let Some(cookie) = record.cookie_value() {
                    self.cookies.rekey(cookie, new_key.clone());
                }
                host.records.insert(new_key, record);
            }
        }
        Ok(vec![events::rename_test(&host.meta.name, test, new_test, sender)])
    }

    /// Expire every record whose validity has passed.
    ///
    /// Stale records turn purple, unless the host's connectivity test is
    /// currently (and validly) reporting a problem, in which case they turn
    /// clear. A stale connectivity test itself always turns purple.
    #[instrument(skip(self))]
    pub fn sweep_stale(&mut self, now: i64) -> Vec<Posting> {
        let conn_test = self.tests.lookup(&self.config.conn_test);
        let mut targets = Vec::new();
        for host in self.hosts.iter() {
            let conn_down = conn_test
                .and_then(|t| host.find(t))
                .is_some_and(|conn| {
                    conn.valid_until >= now
                        && matches!(conn.color, Color::Red | Color::Yellow | Color::Blue | Color::Clear)
                });
            for (key, record) in &host.records {
                if record.valid_until >= now {
                    continue;
                }
                let color = if conn_down && Some(key.test) != conn_test {
                    Color::Clear
                } else {
                    Color::Purple
                };
                targets.push((host.id, key.clone(), color, record.message.clone()));
            }
        }

        let mut postings = Vec::new();
        for (host_id, key, color, message) in targets {
            debug!("record went stale, turning {color}");
            let incoming = Incoming::report(color, &message, INTERNAL_SENDER);
            match self.update(host_id, &key, &incoming, now) {
                Ok(produced) => postings.extend(produced),
                Err(e) => debug!("stale record vanished: {e}"),
            }
        }
        postings
    }

    /// `query HOST.TEST`: color and first message line.
    pub fn query(&self, host: &str, test: &str) -> BoardResult<String> {
        let record = self
            .record(host, test)
            .ok_or_else(|| BoardError::NotFound(format!("{host}.{test}")))?;
        let line = record.first_line();
        let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
        let text = if Color::parse(word).is_some() { rest } else { line };
        Ok(format!("{} {text}", record.color))
    }

    /// `log HOST.TEST`: all state fields followed by the full message.
    pub fn log(&self, host: &str, test: &str) -> BoardResult<String> {
        let record = self
            .record(host, test)
            .ok_or_else(|| BoardError::NotFound(format!("{host}.{test}")))?;
        let host_name = self.host_meta(host).map(|m| m.name.as_str()).unwrap_or(host);
        Ok(format!(
            "{host_name}|{test}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}\n{}",
            record.color,
            record.testflags.as_deref().unwrap_or(""),
            record.last_change,
            record.log_time,
            record.valid_until,
            record.ack_time(),
            record.enable_time(),
            record.sender,
            record.cookie_value().map_or(-1, i64::from),
            crate::util::nlencode(record.ack_message()),
            crate::util::nlencode(record.disable_message()),
            record.message
        ))
    }

    /// Hosts reported under the `log` ghost policy: `host|sender|lastseen`.
    pub fn ghost_list(&self) -> String {
        self.ghosts
            .iter()
            .map(|(host, ghost)| format!("{host}|{}|{}\n", ghost.sender, ghost.last_seen))
            .collect()
    }

    pub fn ghost_count(&self) -> usize {
        self.ghosts.len()
    }

    /// Apply a new host list. Configured hosts that disappeared are dropped,
    /// and so are report-created hosts unless ghosts are allowed.
    #[instrument(skip_all)]
    pub fn reload_hosts(&mut self, hosts: &[HostConfig], sender: &str) -> Vec<Posting> {
        let mut keep = HashSet::new();
        for host in hosts {
            keep.insert(self.hosts.upsert(HostMeta::from_config(host), &host.aliases));
        }
        let allow_ghosts = self.config.ghost_policy == GhostPolicy::Allow;
        let doomed: Vec<String> = self
            .hosts
            .iter()
            .filter(|h| !keep.contains(&h.id) && (h.meta.configured || !allow_ghosts))
            .map(|h| h.meta.name.clone())
            .collect();

        let mut postings = Vec::new();
        for name in doomed {
            if let Ok(produced) = self.drop_host(&name, sender) {
                postings.extend(produced);
            }
        }
        info!("host list reloaded: {} hosts", self.hosts.len());
        postings
    }

    fn admit_host(&mut self, name: &str, sender: &str, now: i64) -> BoardResult<HostId> {
        if let Some(id) = self.hosts.resolve(name) {
            return Ok(id);
        }
        match self.config.ghost_policy {
            GhostPolicy::Allow => {
                debug!("creating host {name} on first report");
                Ok(self.hosts.upsert(HostMeta::unconfigured(name), &[]))
            }
            GhostPolicy::Drop => Err(BoardError::GhostHost(name.to_string())),
            GhostPolicy::Log => {
                self.ghosts.insert(
                    name.to_ascii_lowercase(),
                    GhostEntry {
                        sender: sender.to_string(),
                        last_seen: now,
                    },
                );
                Err(BoardError::GhostHost(name.to_string()))
            }
        }
    }

    fn resolve(&self, host: &str) -> BoardResult<HostId> {
        self.hosts
            .resolve(host)
            .ok_or_else(|| BoardError::NotFound(host.to_string()))
    }

    fn locate(&self, host: &str, test: &str) -> BoardResult<(HostId, RecordKey)> {
        let not_found = || BoardError::NotFound(format!("{host}.{test}"));
        let host_id = self.hosts.resolve(host).ok_or_else(not_found)?;
        let test_id = self.tests.lookup(test).ok_or_else(not_found)?;
        let key = self
            .hosts
            .get(host_id)
            .and_then(|h| h.find_key(test_id))
            .ok_or_else(not_found)?;
        Ok((host_id, key))
    }

    fn keys_matching(&self, host_id: HostId, test: &str) -> BoardResult<Vec<RecordKey>> {
        let host = self
            .hosts
            .get(host_id)
            .ok_or_else(|| BoardError::NotFound(test.to_string()))?;
        let keys: Vec<RecordKey> = if test == "*" {
            host.records.keys().cloned().collect()
        } else {
            self.tests
                .lookup(test)
                .map(|t| host.keys_for(t))
                .unwrap_or_default()
        };
        if keys.is_empty() {
            return Err(BoardError::NotFound(format!("{}.{test}", host.meta.name)));
        }
        Ok(keys)
    }

    fn host_mut(&mut self, host_id: HostId) -> BoardResult<&mut Host> {
        self.hosts
            .get_mut(host_id)
            .ok_or_else(|| BoardError::NotFound("host vanished".to_string()))
    }

    fn record_mut(&mut self, host_id: HostId, key: &RecordKey) -> BoardResult<&mut LogRecord> {
        self.host_mut(host_id)?
            .records
            .get_mut(key)
            .ok_or_else(|| BoardError::NotFound("record vanished".to_string()))
    }

    /// Mutate a record, then describe it with one of the event builders.
    fn with_record_view(
        &mut self,
        host_id: HostId,
        key: &RecordKey,
        sender: &str,
        change: impl FnOnce(&mut LogRecord),
        build: fn(&RecordView<'_>) -> Posting,
    ) -> BoardResult<Posting> {
        let host = self
            .hosts
            .get_mut(host_id)
            .ok_or_else(|| BoardError::NotFound("host vanished".to_string()))?;
        let Host { meta, records, .. } = host;
        let record = records
            .get_mut(key)
            .ok_or_else(|| BoardError::NotFound("record vanished".to_string()))?;
        change(record);
        Ok(build(&RecordView {
            host: meta,
            test: self.tests.name(key.test),
            record,
            sender,
        }))
    }

    fn update(
        &mut self,
        host_id: HostId,
        key: &RecordKey,
        incoming: &Incoming<'_>,
        now: i64,
    ) -> BoardResult<Vec<Posting>> {
        let host = self
            .hosts
            .get_mut(host_id)
            .ok_or_else(|| BoardError::NotFound("host vanished".to_string()))?;
        let Host { meta, records, .. } = host;
        let record = records
            .get_mut(key)
            .ok_or_else(|| BoardError::NotFound("record vanished".to_string()))?;
        let mut machine = Machine {
            config: &self.config,
            cookies: &mut self.cookies,
            host_id,
            host: meta,
            key,
            test: self.tests.name(key.test),
        };
        Ok(machine.apply(record, incoming, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelKind, Route};
    use crate::color::ColorSet;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    const T0: i64 = 1_700_000_000;

    fn store() -> StatusStore {
        StatusStore::with_cookies(StoreConfig::default(), &[], CookieJar::with_seed(7))
    }

    fn report(host: &str, test: &str, color: Color, text: &str) -> StatusReport {
        StatusReport {
            host: host.to_string(),
            test: test.to_string(),
            color,
            message: format!("{color} {text}"),
            lifetime_mins: None,
            group: None,
            client_ts: None,
        }
    }

    fn markers(postings: &[Posting]) -> Vec<String> {
        postings.iter().map(|p| p.envelope.marker.clone()).collect()
    }

    fn apply(store: &mut StatusStore, color: Color, now: i64) -> Vec<Posting> {
        store
            .apply_report(&report("web1", "http", color, "check"), "10.0.0.1", now)
            .unwrap()
    }

    #[test]
    fn test_first_report_posts_stachg_and_status() {
        let mut store = store();
        let postings = apply(&mut store, Color::Green, T0);
        assert_eq!(markers(&postings), vec!["stachg", "status"]);

        let record = store.record("web1", "http").unwrap();
        assert_eq!(record.color, Color::Green);
        assert_eq!(record.valid_until, T0 + 30 * 60);
        assert!(record.history_synced);

        // same color again: status only
        let postings = apply(&mut store, Color::Green, T0 + 60);
        assert_eq!(markers(&postings), vec!["status"]);
    }

    #[test]
    fn test_alert_sets_cookie_and_pages() {
        let mut store = store();
        apply(&mut store, Color::Green, T0);
        let postings = apply(&mut store, Color::Red, T0 + 60);
        assert_eq!(markers(&postings), vec!["stachg", "page", "status"]);
        assert!(postings[1].goes_to(ChannelKind::Page));

        let record = store.record("web1", "http").unwrap();
        assert!(record.alert_active);
        let cookie = record.cookie.unwrap();
        assert!(cookie.value < 1_000_000);
        assert_eq!(cookie.expires, T0 + 60 + 86400);
        assert_eq!(store.live_cookies(), 1);

        // recovery pages once more, then clears the cookie
        let postings = apply(&mut store, Color::Green, T0 + 120);
        assert_eq!(markers(&postings), vec!["stachg", "page", "status"]);
        let record = store.record("web1", "http").unwrap();
        assert!(!record.alert_active);
        assert_eq!(record.cookie, None);
        assert_eq!(store.live_cookies(), 0);
    }

    #[test]
    fn test_declared_lifetime_sets_validity() {
        let mut store = store();
        let mut status = report("web1", "http", Color::Green, "ok");
        status.lifetime_mins = Some(90);
        store.apply_report(&status, "agent", T0).unwrap();
        assert_eq!(store.record("web1", "http").unwrap().valid_until, T0 + 90 * 60);
    }

    #[test]
    fn test_modifier_overrides_reported_color_and_decays() {
        let mut store = store();
        apply(&mut store, Color::Green, T0);
        let postings = store
            .modify("web1", "http", Color::Yellow, "rrd", "latency high", "admin", T0 + 10)
            .unwrap();
        assert_eq!(markers(&postings), vec!["stachg", "page", "status"]);
        assert_eq!(store.record("web1", "http").unwrap().color, Color::Yellow);

        // one report later the modifier is still active
        apply(&mut store, Color::Green, T0 + 60);
        let record = store.record("web1", "http").unwrap();
        assert_eq!(record.color, Color::Yellow);
        assert_eq!(record.modifiers[0].cause, "&yellow latency high");

        // and then it is gone
        apply(&mut store, Color::Green, T0 + 120);
        let record = store.record("web1", "http").unwrap();
        assert_eq!(record.color, Color::Green);
        assert!(record.modifiers.is_empty());
    }

    #[test]
    fn test_flapping_keeps_worst_color_but_counts_changes() {
        let mut store = store();
        let mut now = T0;
        let mut color = Color::Green;
        // five changes inside the 30 minute threshold fill the ring
        for _ in 0..6 {
            apply(&mut store, color, now);
            color = if color == Color::Green { Color::Red } else { Color::Green };
            now += 60;
        }
        let before = store.record("web1", "http").unwrap().clone();
        assert_eq!(before.color, Color::Red);
        assert!(before.flap.is_full());

        let postings = apply(&mut store, Color::Green, now);
        let after = store.record("web1", "http").unwrap();
        assert!(after.flapping);
        assert_eq!(after.color, Color::Red);
        assert_eq!(after.change_count, before.change_count + 1);
        assert_eq!(after.flap.newest(), Some(now));
        assert!(!markers(&postings).contains(&"stachg".to_string()));
    }

    #[test]
    fn test_worse_color_passes_while_flapping() {
        let mut store = store();
        let mut now = T0;
        for color in [Color::Green, Color::Yellow, Color::Green, Color::Yellow, Color::Green, Color::Yellow] {
            apply(&mut store, color, now);
            now += 30;
        }
        apply(&mut store, Color::Red, now);
        let record = store.record("web1", "http").unwrap();
        assert!(record.flapping);
        assert_eq!(record.color, Color::Red);
    }

    #[test]
    fn test_timed_disable_forces_blue_until_expiry() {
        let mut store = store();
        apply(&mut store, Color::Red, T0);
        let postings = store
            .disable("web1", "http", DisableDuration::Minutes(60), "", "admin", T0 + 10)
            .unwrap();
        assert_eq!(markers(&postings)[0], "enadis");

        let record = store.record("web1", "http").unwrap();
        assert_eq!(record.color, Color::Blue);
        assert_eq!(record.disable_message(), "(No reason given)");
        let until = record.enable_time();
        assert_eq!(until % 60, 0);
        assert!(until >= T0 + 10 + 3600);
        assert!(record.valid_until >= until);

        apply(&mut store, Color::Red, T0 + 600);
        assert_eq!(store.record("web1", "http").unwrap().color, Color::Blue);

        let postings = apply(&mut store, Color::Red, until + 1);
        assert_eq!(markers(&postings)[0], "enadis");
        let record = store.record("web1", "http").unwrap();
        assert_eq!(record.color, Color::Red);
        assert!(record.disable.is_none());
    }

    #[test]
    fn test_disable_until_recovery() {
        let mut store = store();
        apply(&mut store, Color::Red, T0);
        store
            .disable("web1", "*", DisableDuration::UntilRecovery, "maintenance", "admin", T0)
            .unwrap();
        assert_eq!(store.record("web1", "http").unwrap().valid_until, record::FOREVER);

        apply(&mut store, Color::Yellow, T0 + 60);
        assert_eq!(store.record("web1", "http").unwrap().color, Color::Blue);

        let postings = apply(&mut store, Color::Green, T0 + 120);
        assert_eq!(markers(&postings)[0], "enadis");
        let record = store.record("web1", "http").unwrap();
        assert_eq!(record.color, Color::Green);
        assert!(record.disable.is_none());
    }

    #[test]
    fn test_enable_restores_reported_color() {
        let mut store = store();
        apply(&mut store, Color::Yellow, T0);
        store
            .disable("web1", "http", DisableDuration::Minutes(30), "work", "admin", T0)
            .unwrap();
        let postings = store.enable("web1", "http", "admin", T0 + 60).unwrap();
        assert_eq!(markers(&postings)[0], "enadis");
        assert_eq!(store.record("web1", "http").unwrap().color, Color::Yellow);
    }

    #[test]
    fn test_ack_round_trip() {
        let mut store = store();
        apply(&mut store, Color::Red, T0);
        let cookie = store.record("web1", "http").unwrap().cookie.unwrap().value;

        let postings = store
            .ack(cookie, None, 60, "investigating", "10.0.0.9", T0 + 10)
            .unwrap();
        assert_eq!(markers(&postings), vec!["ack"]);
        assert_eq!(postings[0].route, Route::One(ChannelKind::Page));
        let record = store.record("web1", "http").unwrap();
        assert_eq!(record.ack_time(), T0 + 10 + 3600);
        assert!(record.valid_until >= record.ack_time());

        // still red but ack valid: kept
        apply(&mut store, Color::Red, T0 + 600);
        assert_eq!(store.record("web1", "http").unwrap().ack_message(), "investigating");

        // expired
        apply(&mut store, Color::Red, T0 + 10 + 3600);
        assert!(store.record("web1", "http").unwrap().ack.is_none());
    }

    #[test]
    fn test_ack_cleared_on_recovery() {
        let mut store = store();
        apply(&mut store, Color::Red, T0);
        let cookie = store.record("web1", "http").unwrap().cookie_value().unwrap();
        store.ack(cookie, Some(("web1", "http")), 30, "x", "op", T0).unwrap();
        apply(&mut store, Color::Green, T0 + 60);
        assert!(store.record("web1", "http").unwrap().ack.is_none());
    }

    #[test]
    fn test_ack_rejects_unknown_or_mismatched_cookie() {
        let mut store = store();
        apply(&mut store, Color::Red, T0);
        store
            .apply_report(&report("db1", "disk", Color::Green, "ok"), "x", T0)
            .unwrap();
        let cookie = store.record("web1", "http").unwrap().cookie_value().unwrap();

        assert_matches!(
            store.ack(cookie.wrapping_add(1) % 1_000_000, None, 30, "", "op", T0),
            Err(BoardError::UnknownCookie(_))
        );
        assert_matches!(
            store.ack(cookie, Some(("db1", "disk")), 30, "", "op", T0),
            Err(BoardError::UnknownCookie(_))
        );
    }

    #[test]
    fn test_sweep_turns_stale_records_purple() {
        let mut store = store();
        apply(&mut store, Color::Green, T0);
        assert!(store.sweep_stale(T0 + 60).is_empty());

        let postings = store.sweep_stale(T0 + 31 * 60);
        assert_eq!(markers(&postings), vec!["stachg", "page", "status"]);
        let record = store.record("web1", "http").unwrap();
        assert_eq!(record.color, Color::Purple);
        assert_eq!(record.sender, INTERNAL_SENDER);
    }

    #[test]
    fn test_sweep_uses_clear_when_host_unreachable() {
        let mut store = store();
        apply(&mut store, Color::Green, T0);
        let mut conn = report("web1", "conn", Color::Red, "no ping");
        conn.lifetime_mins = Some(120);
        store.apply_report(&conn, "prober", T0 + 30 * 60).unwrap();

        store.sweep_stale(T0 + 31 * 60);
        assert_eq!(store.record("web1", "http").unwrap().color, Color::Clear);
        assert_eq!(store.record("web1", "conn").unwrap().color, Color::Red);
    }

    #[test]
    fn test_sweep_ignores_stale_connectivity_test() {
        let mut store = store();
        apply(&mut store, Color::Green, T0);
        store
            .apply_report(&report("web1", "conn", Color::Red, "no ping"), "prober", T0)
            .unwrap();

        store.sweep_stale(T0 + 31 * 60);
        assert_eq!(store.record("web1", "http").unwrap().color, Color::Purple);
        assert_eq!(store.record("web1", "conn").unwrap().color, Color::Purple);
    }

    #[test]
    fn test_ghost_policies() {
        let mut config = StoreConfig::default();
        config.ghost_policy = GhostPolicy::Log;
        let hosts = vec![HostConfig {
            name: "known".into(),
            ..Default::default()
        }];
        let mut store = StatusStore::new(config, &hosts);

        let err = store
            .apply_report(&report("stranger", "cpu", Color::Green, "ok"), "10.1.1.1", T0)
            .unwrap_err();
        assert_matches!(err, BoardError::GhostHost(_));
        assert_eq!(store.ghost_list(), format!("stranger|10.1.1.1|{T0}\n"));
        assert_eq!(store.host_count(), 1);

        store
            .apply_report(&report("KNOWN", "cpu", Color::Green, "ok"), "10.1.1.1", T0)
            .unwrap();
        assert_eq!(store.record_count(), 1);
    }

    #[test]
    fn test_drop_and_rename() {
        let mut store = store();
        apply(&mut store, Color::Red, T0);
        store
            .apply_report(&report("web1", "cpu", Color::Green, "ok"), "x", T0)
            .unwrap();

        let postings = store.rename_test("web1", "http", "https", "admin").unwrap();
        assert_eq!(postings[0].route, Route::All);
        assert!(store.record("web1", "http").is_none());
        let cookie = store.record("web1", "https").unwrap().cookie_value().unwrap();
        store.ack(cookie, Some(("web1", "https")), 5, "", "op", T0).unwrap();

        store.rename_host("web1", "web2", "admin").unwrap();
        assert_eq!(store.host_color("web2"), Some(Color::Red));

        store.drop_test("web2", "cpu", "admin").unwrap();
        assert_eq!(store.record_count(), 1);

        let postings = store.drop_host("web2", "admin").unwrap();
        assert_eq!(markers(&postings), vec!["drophost"]);
        assert_eq!(store.live_cookies(), 0);
        assert_eq!(store.host_count(), 0);
    }

    #[test]
    fn test_custom_alert_colors() {
        let mut config = StoreConfig::default();
        config.alert_colors = ColorSet::of(&[Color::Red]);
        let mut store = StatusStore::new(config, &[]);
        let postings = apply(&mut store, Color::Yellow, T0);
        assert!(!markers(&postings).contains(&"page".to_string()));
        assert!(store.record("web1", "http").unwrap().cookie.is_none());
    }

    #[test]
    fn test_reload_drops_unlisted_hosts() {
        let hosts = vec![
            HostConfig {
                name: "a".into(),
                ..Default::default()
            },
            HostConfig {
                name: "b".into(),
                ..Default::default()
            },
        ];
        let mut store = StatusStore::new(StoreConfig::default(), &hosts);
        store
            .apply_report(&report("b", "cpu", Color::Green, "ok"), "x", T0)
            .unwrap();
        let postings = store.reload_hosts(&hosts[..1], "reload");
        assert_eq!(markers(&postings), vec!["drophost"]);
        assert_eq!(store.host_count(), 1);
        assert!(store.host_meta("a").is_some());
    }
}
