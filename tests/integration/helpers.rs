//! Helper functions for integration tests

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use boardwatch::alert::{Dispatcher, MatchContext, Notification, RuleDefaults, RuleSet};
use boardwatch::channel::{ChannelKind, ChannelMessage, Posting};
use boardwatch::color::{Color, ColorSet};
use boardwatch::config::{AlerterConfig, DaemonConfig, StoreConfig};
use boardwatch::error::BoardResult;
use boardwatch::store::StatusReport;
use boardwatch::store::StatusStore;
use boardwatch::store::cookie::CookieJar;

pub const T0: i64 = 1_700_000_000;

pub fn store() -> StatusStore {
    StatusStore::with_cookies(StoreConfig::default(), &[], CookieJar::with_seed(42))
}

pub fn report(host: &str, test: &str, color: Color, text: &str) -> StatusReport {
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

/// Page-channel postings as a reader of that channel would see them.
pub fn page_messages(postings: &[Posting], now: i64) -> Vec<ChannelMessage> {
    postings
        .iter()
        .filter(|p| p.goes_to(ChannelKind::Page))
        .enumerate()
        .map(|(i, p)| ChannelMessage::decode(&p.envelope.encode(i as u32 + 1, now, 0)).unwrap())
        .collect()
}

pub fn rules(text: &str) -> RuleSet {
    RuleSet::parse(
        text,
        &RuleDefaults {
            repeat_secs: 1800,
            colors: ColorSet::DEFAULT_ALERT,
        },
    )
}

pub fn ctx(now: i64) -> MatchContext {
    MatchContext::new(now, ColorSet::DEFAULT_ALERT)
}

pub fn daemon_config(json: &str) -> DaemonConfig {
    serde_json::from_str(json).unwrap()
}

pub fn alerter_config(dir: &tempfile::TempDir, rules: &str) -> AlerterConfig {
    let path = dir.path().join("alerts.cfg");
    std::fs::write(&path, rules).unwrap();
    AlerterConfig {
        rules: path,
        checkpoint: Some(dir.path().join("alerts.chk")),
        checkpoint_interval_secs: 900,
        mail_command: "mail".into(),
        script_timeout_secs: 30,
        default_repeat_mins: 30,
        alert_colors: ColorSet::DEFAULT_ALERT,
        pass_interval_secs: 0,
    }
}

/// Keeps every notification instead of sending it
#[derive(Default)]
pub struct RecordingDispatcher {
    pub sent: Mutex<Vec<Notification>>,
}

impl RecordingDispatcher {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    /// Wait until at least `count` notifications went out.
    pub async fn wait_for(self: &Arc<Self>, count: usize) -> Vec<Notification> {
        for _ in 0..200 {
            let sent = self.sent();
            if sent.len() >= count {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("expected {count} notifications, got {:?}", self.sent());
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn dispatch(&self, notification: Notification) -> BoardResult<()> {
        self.sent.lock().unwrap().push(notification);
        Ok(())
    }
}

/// The cookie in a subject like `Xymon [123456] web1:http CRITICAL (RED)`
pub fn cookie_from_subject(subject: &str) -> u32 {
    let start = subject.find('[').unwrap() + 1;
    let end = subject.find(']').unwrap();
    subject[start..end].parse().unwrap()
}
