//! Checkpoint snapshots of the status store
//!
//! One line per log record:
//!
//! ```text
//! @@BOARDCHK-V1|origin|host|test|sender|color|testflags|oldcolor|logtime|lastchange|
//!     validtime|enabletime|acktime|cookie|cookieexpires|msg|dismsg|ackmsg|changecount
//! ```
//!
//! Text fields are newline-encoded. `enabletime` is `-1` for "disabled
//! until OK", `cookie` is `-1` when none is held.

use std::io::Write;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::color::Color;
use crate::config::GhostPolicy;
use crate::error::{BoardError, BoardResult};
use crate::util::{nldecode, nlencode};

use super::StatusStore;
use super::host::{HostMeta, RecordKey};
use super::machine::{AlertLevel, alert_level};
use super::record::{Ack, Cookie, Disable, DisableUntil, LogRecord};

const MARKER: &str = "@@BOARDCHK-V1";
/// Fields up to and including `ackmsg`; `changecount` is optional
const MIN_FIELDS: usize = 18;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub restored: usize,
    pub skipped: usize,
}

impl StatusStore {
    /// Render the whole store as checkpoint text.
    pub fn checkpoint_text(&self) -> String {
        let mut out = String::new();
        for host in self.hosts.iter() {
            for (key, record) in &host.records {
                let fields = [
                    MARKER.to_string(),
                    nlencode(&key.origin),
                    host.meta.name.clone(),
                    self.tests.name(key.test).to_string(),
                    nlencode(&record.sender),
                    record.color.to_string(),
                    nlencode(record.testflags.as_deref().unwrap_or_default()),
                    record.old_color.to_string(),
                    record.log_time.to_string(),
                    record.last_change.to_string(),
                    record.valid_until.to_string(),
                    record.enable_time().to_string(),
                    record.ack_time().to_string(),
                    record.cookie_value().map_or(-1, i64::from).to_string(),
                    record.cookie.map_or(0, |c| c.expires).to_string(),
                    nlencode(&record.message),
                    nlencode(record.disable_message()),
                    nlencode(record.ack_message()),
                    record.change_count.to_string(),
                ];
                out.push_str(&fields.join("|"));
                out.push('\n');
            }
        }
        out
    }

    /// Load checkpoint text into the store. Malformed lines and lines for
    /// hosts that may not exist are skipped, never fatal.
    pub fn restore(&mut self, text: &str, now: i64) -> RestoreSummary {
        let mut summary = RestoreSummary::default();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match self.restore_line(line, now) {
                Ok(()) => summary.restored += 1,
                Err(e) => {
                    debug!("checkpoint line {} skipped: {e}", lineno + 1);
                    summary.skipped += 1;
                }
            }
        }
        info!(
            "restored {} records from checkpoint, skipped {}",
            summary.restored, summary.skipped
        );
        summary
    }

    fn restore_line(&mut self, line: &str, now: i64) -> BoardResult<()> {
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() < MIN_FIELDS || fields[0] != MARKER {
            return Err(BoardError::Checkpoint(format!(
                "expected {MIN_FIELDS} fields, got {}",
                fields.len()
            )));
        }
        let number = |idx: usize| -> BoardResult<i64> {
            fields[idx]
                .parse()
                .map_err(|_| BoardError::Checkpoint(format!("field {idx} is not a number")))
        };
        let color = |idx: usize| -> BoardResult<Color> {
            Color::parse(fields[idx])
                .ok_or_else(|| BoardError::Checkpoint(format!("field {idx} is not a color")))
        };

        let host_name = fields[2];
        let host_id = match self.hosts.resolve(host_name) {
            Some(id) => id,
            None if self.config.ghost_policy == GhostPolicy::Allow => {
                self.hosts.upsert(HostMeta::unconfigured(host_name), &[])
            }
            None => return Err(BoardError::NotFound(host_name.to_string())),
        };
        let test = self.tests.intern(fields[3]);
        let origin = nldecode(fields[1]);
        let mut record = LogRecord::new(test, &origin, self.config.flap_count, now);
        let key = RecordKey { test, origin };
        record.sender = nldecode(fields[4]);
        record.color = color(5)?;
        record.reported_color = record.color;
        record.testflags = Some(nldecode(fields[6])).filter(|f| !f.is_empty());
        record.old_color = color(7)?;
        record.log_time = number(8)?;
        record.last_change = number(9)?;
        record.valid_until = number(10)?;
        record.message = nldecode(fields[15]);
        record.change_count = fields
            .get(18)
            .and_then(|n| n.parse().ok())
            .unwrap_or_default();

        let disable_message = nldecode(fields[16]);
        record.disable = match number(11)? {
            0 => None,
            -1 => Some(Disable {
                until: DisableUntil::Recovery,
                message: disable_message,
            }),
            until => Some(Disable {
                until: DisableUntil::Time(until),
                message: disable_message,
            }),
        };
        record.ack = match number(12)? {
            0 => None,
            until => Some(Ack {
                until,
                message: nldecode(fields[17]),
            }),
        };

        record.alert_active = alert_level(&self.config, record.color) == AlertLevel::Alert;
        if let Ok(value) = u32::try_from(number(13)?) {
            let expires = number(14)?;
            if expires >= now && self.cookies.restore(value, host_id, key.clone()) {
                record.cookie = Some(Cookie { value, expires });
            } else {
                warn!("dropping stale or duplicate cookie for {host_name}.{}", fields[3]);
            }
        }
        // the history already knows about this state
        record.history_synced = true;

        let host = self
            .hosts
            .get_mut(host_id)
            .ok_or_else(|| BoardError::NotFound(host_name.to_string()))?;
        if let Some(previous) = host.records.insert(key, record) {
            if let Some(cookie) = previous.cookie_value() {
                self.cookies.revoke(cookie);
            }
        }
        Ok(())
    }
}

/// Write checkpoint text through a temporary file so a crash never leaves
/// a truncated snapshot behind.
pub fn write_checkpoint(path: &Path, text: &str) -> BoardResult<()> {
    let tmp = path.with_extension("tmp");
    let mut file = std::fs::File::create(&tmp)?;
    file.write_all(text.as_bytes())?;
    file.sync_all()?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_checkpoint(path: &Path) -> BoardResult<String> {
    Ok(std::fs::read_to_string(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HostConfig, StoreConfig};
    use crate::store::{DisableDuration, StatusReport};
    use pretty_assertions::assert_eq;

    const T0: i64 = 1_700_000_000;

    fn report(host: &str, test: &str, color: Color) -> StatusReport {
        StatusReport {
            host: host.to_string(),
            test: test.to_string(),
            color,
            message: format!("{color} line one\nline | two"),
            lifetime_mins: None,
            group: None,
            client_ts: None,
        }
    }

    fn hosts() -> Vec<HostConfig> {
        ["web1", "db1"]
            .into_iter()
            .map(|name| HostConfig {
                name: name.to_string(),
                ..Default::default()
            })
            .collect()
    }

    #[test]
    fn test_round_trip_preserves_state() {
        let mut store = StatusStore::new(StoreConfig::default(), &hosts());
        store.apply_report(&report("web1", "http", Color::Red), "a", T0).unwrap();
        store.apply_report(&report("db1", "disk", Color::Green), "b", T0).unwrap();
        store
            .disable("db1", "disk", DisableDuration::UntilRecovery, "swap disk", "op", T0)
            .unwrap();
        let cookie = store.record("web1", "http").unwrap().cookie_value().unwrap();
        store.ack(cookie, None, 30, "on it", "op", T0 + 5).unwrap();

        let text = store.checkpoint_text();
        let mut restored = StatusStore::new(StoreConfig::default(), &hosts());
        let summary = restored.restore(&text, T0 + 10);
        assert_eq!(summary, RestoreSummary { restored: 2, skipped: 0 });
        assert_eq!(restored.record_count(), 2);

        for (host, test) in [("web1", "http"), ("db1", "disk")] {
            let before = store.record(host, test).unwrap();
            let after = restored.record(host, test).unwrap();
            assert_eq!(after.color, before.color);
            assert_eq!(after.old_color, before.old_color);
            assert_eq!(after.log_time, before.log_time);
            assert_eq!(after.last_change, before.last_change);
            assert_eq!(after.valid_until, before.valid_until);
            assert_eq!(after.ack, before.ack);
            assert_eq!(after.disable, before.disable);
            assert_eq!(after.cookie, before.cookie);
            assert_eq!(after.message, before.message);
            assert_eq!(after.change_count, before.change_count);
        }

        // the restored cookie still acknowledges
        restored.ack(cookie, Some(("web1", "http")), 10, "again", "op", T0 + 20).unwrap();
    }

    #[test]
    fn test_restore_skips_malformed_and_removed_hosts() {
        let mut store = StatusStore::new(StoreConfig::default(), &hosts());
        store.apply_report(&report("web1", "http", Color::Green), "a", T0).unwrap();
        store.apply_report(&report("db1", "disk", Color::Green), "b", T0).unwrap();
        let mut text = store.checkpoint_text();
        text.push_str("@@BOARDCHK-V1|short|line\n");
        text.push_str("garbage\n");

        let mut config = StoreConfig::default();
        config.ghost_policy = GhostPolicy::Drop;
        let mut restored = StatusStore::new(config, &hosts()[..1]);
        let summary = restored.restore(&text, T0);
        assert_eq!(summary, RestoreSummary { restored: 1, skipped: 3 });
        assert!(restored.record("db1", "disk").is_none());
    }

    #[test]
    fn test_separators_in_sender_and_flags_survive() {
        let mut store = StatusStore::new(StoreConfig::default(), &hosts());
        let mut flagged = report("web1", "http", Color::Yellow);
        flagged.message = "yellow [flags:OR|dn] slow\nsecond line".to_string();
        store.apply_report(&flagged, "10.0.0.1|relay\nb", T0).unwrap();

        let text = store.checkpoint_text();
        assert_eq!(text.lines().count(), 1);
        let mut restored = StatusStore::new(StoreConfig::default(), &hosts());
        assert_eq!(restored.restore(&text, T0 + 10), RestoreSummary { restored: 1, skipped: 0 });

        let after = restored.record("web1", "http").unwrap();
        assert_eq!(after.sender, "10.0.0.1|relay\nb");
        assert_eq!(after.testflags.as_deref(), Some("OR|dn"));
        assert_eq!(after.color, Color::Yellow);
        assert_eq!(after.message, flagged.message);
    }

    #[test]
    fn test_write_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("board.chk");
        write_checkpoint(&path, "first\n").unwrap();
        write_checkpoint(&path, "second\n").unwrap();
        assert_eq!(read_checkpoint(&path).unwrap(), "second\n");
        assert!(!path.with_extension("tmp").exists());
    }
}
