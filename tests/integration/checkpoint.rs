//! Board and alerter state surviving a restart

use std::sync::Arc;

use boardwatch::alert::{AlertState, AlertTracker, Alerter, checkpoint};
use boardwatch::color::{Color, ColorSet};
use boardwatch::store::checkpoint::{read_checkpoint, write_checkpoint};
use boardwatch::util::now_secs;
use pretty_assertions::assert_eq;

use crate::helpers::{
    RecordingDispatcher, T0, alerter_config, ctx, page_messages, report, rules, store,
};

#[test]
fn test_board_restart_keeps_records_and_cookies() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("board.chk");

    let mut before = store();
    before
        .apply_report(&report("web1", "http", Color::Red, "slow response"), "10.0.0.5", T0)
        .unwrap();
    before
        .apply_report(&report("db1", "disk", Color::Yellow, "91% full"), "10.0.0.6", T0)
        .unwrap();
    let cookie = before.record("web1", "http").unwrap().cookie_value().unwrap();
    write_checkpoint(&path, &format!("{}garbage\n", before.checkpoint_text())).unwrap();

    let mut after = store();
    let summary = after.restore(&read_checkpoint(&path).unwrap(), T0 + 60);
    assert_eq!(summary.restored, 2);
    assert_eq!(summary.skipped, 1);

    assert_eq!(after.host_color("web1"), Some(Color::Red));
    assert_eq!(after.query("db1", "disk").unwrap(), "yellow 91% full");
    let record = after.record("web1", "http").unwrap();
    assert_eq!(record.last_change, T0);
    assert!(record.alert_active);
    assert_eq!(after.live_cookies(), 1);

    // the restored cookie still acknowledges the alert
    let postings = after
        .ack(cookie, Some(("web1", "http")), 30, "on it", "10.0.0.9", T0 + 120)
        .unwrap();
    assert_eq!(postings.len(), 1);
    assert_eq!(after.record("web1", "http").unwrap().ack_time(), T0 + 120 + 30 * 60);
}

#[tokio::test]
async fn test_alerter_restart_keeps_acknowledgement() {
    let dir = tempfile::tempdir().unwrap();
    let rules_text = "HOST=web1\n MAIL ops@example.com\n";
    let config = alerter_config(&dir, rules_text);
    let path = config.checkpoint.clone().unwrap();
    let rules = rules(rules_text);
    let now = now_secs();

    let mut board = store();
    let mut tracker = AlertTracker::new(ColorSet::DEFAULT_ALERT);
    let postings = board
        .apply_report(&report("web1", "http", Color::Red, "down"), "10.0.0.5", now)
        .unwrap();
    for msg in page_messages(&postings, now) {
        tracker.handle(&msg, &rules, &ctx(now));
    }
    assert_eq!(tracker.pass(&rules, &ctx(now), false).len(), 1);

    let cookie = board.record("web1", "http").unwrap().cookie_value().unwrap();
    let postings = board.ack(cookie, None, 120, "rebooting", "10.0.0.9", now).unwrap();
    for msg in page_messages(&postings, now) {
        tracker.handle(&msg, &rules, &ctx(now));
    }
    checkpoint::save(&tracker, &path).unwrap();

    let restarted = Alerter::new(config, Arc::new(RecordingDispatcher::default())).unwrap();
    let alert = restarted.tracker().get("web1", "http").unwrap();
    assert_eq!(alert.state, AlertState::Acked);
    assert_eq!(alert.next_alert_time, now + 120 * 60);
    assert_eq!(alert.ack_message.as_deref(), Some("rebooting"));
    assert_eq!(alert.cookie, i64::from(cookie));
    assert_eq!(alert.max_color, Color::Red);
}
