//! Alerter checkpoint
//!
//! Active alerts are written one per line:
//!
//! ```text
//! host|test|location|ip|color|maxcolor|eventstart|nextalerttime|state|cookie|
//!     class|groups|displaygroup|pagemsg|ackmsg
//! ```
//!
//! The repeat table goes to a companion file with a `.sub` suffix, one
//! `nextalert|key` line per entry.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::color::Color;
use crate::error::{BoardError, BoardResult};
use crate::store::checkpoint::{read_checkpoint, write_checkpoint};
use crate::util::{nldecode, nlencode};

use super::tracker::{ActiveAlert, AlertState, AlertTracker};

const MIN_FIELDS: usize = 14;

fn sub_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".sub");
    PathBuf::from(name)
}

fn parse_line(line: &str) -> BoardResult<ActiveAlert> {
    let fields: Vec<&str> = line.split('|').collect();
    if fields.len() < MIN_FIELDS {
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
    let text = |idx: usize| Some(fields[idx]).filter(|f| !f.is_empty()).map(str::to_string);

    let mut alert = ActiveAlert::new(fields[0], fields[1], number(6)?);
    alert.location = fields[2].to_string();
    alert.ip = fields[3].to_string();
    alert.color = color(4)?;
    alert.max_color = color(5)?;
    alert.next_alert_time = number(7)?;
    alert.state = AlertState::parse(fields[8])
        .ok_or_else(|| BoardError::Checkpoint(format!("unknown state '{}'", fields[8])))?;
    alert.cookie = number(9)?;
    alert.class = text(10);
    alert.groups = fields[11].to_string();
    alert.display_group = text(12);
    alert.page_message = nldecode(fields[13]);
    alert.ack_message = fields.get(14).filter(|m| !m.is_empty()).map(|m| nldecode(m));

    // rules may have changed while we were down
    if alert.state == AlertState::NoRecip {
        alert.state = AlertState::Paging;
    }
    Ok(alert)
}

impl AlertTracker {
    pub fn checkpoint_text(&self) -> String {
        let mut out = String::new();
        for a in self.alerts.iter().filter(|a| a.state != AlertState::Dead) {
            let fields = [
                a.host.clone(),
                a.test.clone(),
                a.location.clone(),
                a.ip.clone(),
                a.color.to_string(),
                a.max_color.to_string(),
                a.event_start.to_string(),
                a.next_alert_time.to_string(),
                a.state.to_string(),
                a.cookie.to_string(),
                a.class.clone().unwrap_or_default(),
                a.groups.clone(),
                a.display_group.clone().unwrap_or_default(),
                nlencode(&a.page_message),
                nlencode(a.ack_message.as_deref().unwrap_or_default()),
            ];
            out.push_str(&fields.join("|"));
            out.push('\n');
        }
        out
    }

    pub fn repeats_text(&self) -> String {
        self.repeats
            .iter()
            .map(|(key, next)| format!("{next}|{key}\n"))
            .collect()
    }

    /// Load alerts and repeat entries. Bad lines are skipped; repeat entries
    /// that already expired are dropped. Returns the number of alerts loaded.
    pub fn restore(&mut self, alerts: &str, repeats: Option<&str>, now: i64) -> usize {
        let mut restored = 0;
        for (lineno, line) in alerts.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match parse_line(line) {
                Ok(alert) => {
                    self.alerts
                        .retain(|a| !(a.host == alert.host && a.test == alert.test));
                    self.alerts.push(alert);
                    restored += 1;
                }
                Err(e) => debug!("alert checkpoint line {} skipped: {e}", lineno + 1),
            }
        }

        for line in repeats.unwrap_or_default().lines() {
            let Some((next, key)) = line.split_once('|') else {
                continue;
            };
            match next.parse::<i64>() {
                Ok(next) if next > now => {
                    self.repeats.insert(key.to_string(), next);
                }
                _ => {}
            }
        }
        restored
    }
}

/// Write the alert lines to `path` and the repeat table next to it.
pub fn write_files(path: &Path, alerts: &str, repeats: &str) -> BoardResult<()> {
    write_checkpoint(path, alerts)?;
    write_checkpoint(&sub_path(path), repeats)
}

pub fn save(tracker: &AlertTracker, path: &Path) -> BoardResult<()> {
    write_files(path, &tracker.checkpoint_text(), &tracker.repeats_text())?;
    debug!("saved {} alerts to {}", tracker.alerts().len(), path.display());
    Ok(())
}

/// Load a checkpoint if one exists. A missing file is not an error.
pub fn load(tracker: &mut AlertTracker, path: &Path, now: i64) -> BoardResult<usize> {
    if !path.exists() {
        return Ok(0);
    }
    let alerts = read_checkpoint(path)?;
    let repeats = read_checkpoint(&sub_path(path)).ok();
    let restored = tracker.restore(&alerts, repeats.as_deref(), now);
    info!("restored {restored} alerts from {}", path.display());
    Ok(restored)
}
