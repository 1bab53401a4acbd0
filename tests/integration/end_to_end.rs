//! A status report travelling from the board to a notification and back
//! through an acknowledgement.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use boardwatch::alert::{AlertState, AlertTracker, Alerter, Method, Notification};
use boardwatch::channel::ChannelKind;
use boardwatch::color::{Color, ColorSet};
use boardwatch::daemon::{BoardActor, BoardHandle};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncWriteExt, BufReader};

use crate::helpers::{
    RecordingDispatcher, T0, alerter_config, cookie_from_subject, ctx, daemon_config, page_messages,
    report, rules, store,
};

const OPS: &str = "HOST=web1\n MAIL ops@example.com RECOVERED\n";

fn targets(notifications: &[Notification]) -> Vec<&str> {
    notifications.iter().map(|n| n.recipient.as_str()).collect()
}

#[test]
fn test_red_report_ack_and_expiry() {
    let mut store = store();
    let rules = rules(OPS);
    let mut tracker = AlertTracker::new(ColorSet::DEFAULT_ALERT);

    let postings = store
        .apply_report(&report("web1", "http", Color::Red, "slow response"), "10.0.0.5", T0)
        .unwrap();
    let record = store.record("web1", "http").unwrap();
    assert_eq!(record.color, Color::Red);
    assert!(record.alert_active);
    let cookie = record.cookie_value().unwrap();

    let pages = page_messages(&postings, T0);
    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].marker, "page");
    assert_eq!(pages[0].field(4), Some("red"));
    assert_eq!(pages[0].field(8), Some(cookie.to_string().as_str()));

    tracker.handle(&pages[0], &rules, &ctx(T0));
    assert_eq!(tracker.get("web1", "http").unwrap().state, AlertState::Paging);

    let sent = tracker.pass(&rules, &ctx(T0), false);
    assert_eq!(targets(&sent), vec!["ops@example.com"]);
    assert_eq!(sent[0].method, Method::Mail);
    assert_eq!(sent[0].state, AlertState::Paging);

    // acknowledged for an hour
    let postings = store
        .ack(cookie, None, 60, "investigating", "10.0.0.9", T0 + 60)
        .unwrap();
    let acks = page_messages(&postings, T0 + 60);
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].marker, "ack");
    tracker.handle(&acks[0], &rules, &ctx(T0 + 60));

    let alert = tracker.get("web1", "http").unwrap();
    assert_eq!(alert.state, AlertState::Acked);
    assert_eq!(alert.next_alert_time, T0 + 60 + 3600);
    assert_eq!(alert.ack_message.as_deref(), Some("investigating"));

    assert!(tracker.pass(&rules, &ctx(T0 + 120), false).is_empty());
    assert!(tracker.pass(&rules, &ctx(T0 + 1900), false).is_empty());

    // no recovery within the hour: paging again
    let sent = tracker.pass(&rules, &ctx(T0 + 3660), false);
    assert_eq!(targets(&sent), vec!["ops@example.com"]);
    assert_eq!(tracker.get("web1", "http").unwrap().state, AlertState::Paging);
}

#[test]
fn test_recovery_notifies_and_retires_the_alert() {
    let mut store = store();
    let rules = rules(OPS);
    let mut tracker = AlertTracker::new(ColorSet::DEFAULT_ALERT);

    let postings = store
        .apply_report(&report("web1", "http", Color::Red, "down"), "10.0.0.5", T0)
        .unwrap();
    for msg in page_messages(&postings, T0) {
        tracker.handle(&msg, &rules, &ctx(T0));
    }
    assert_eq!(tracker.pass(&rules, &ctx(T0), false).len(), 1);

    let postings = store
        .apply_report(&report("web1", "http", Color::Green, "up"), "10.0.0.5", T0 + 300)
        .unwrap();
    assert_eq!(store.record("web1", "http").unwrap().cookie, None);
    for msg in page_messages(&postings, T0 + 300) {
        tracker.handle(&msg, &rules, &ctx(T0 + 300));
    }
    assert_eq!(tracker.get("web1", "http").unwrap().state, AlertState::Recovered);

    let sent = tracker.pass(&rules, &ctx(T0 + 300), false);
    assert_eq!(targets(&sent), vec!["ops@example.com"]);
    assert_eq!(sent[0].state, AlertState::Recovered);
    assert!(tracker.alerts().is_empty());
}

#[test]
fn test_unrouted_host_never_notifies() {
    let mut store = store();
    let rules = rules(OPS);
    let mut tracker = AlertTracker::new(ColorSet::DEFAULT_ALERT);

    let postings = store
        .apply_report(&report("db1", "disk", Color::Red, "full"), "10.0.0.6", T0)
        .unwrap();
    for msg in page_messages(&postings, T0) {
        tracker.handle(&msg, &rules, &ctx(T0));
    }
    assert!(tracker.pass(&rules, &ctx(T0), false).is_empty());
    assert_eq!(tracker.get("db1", "disk").unwrap().state, AlertState::NoRecip);
}

/// Board actor and alerter wired together the way a page-channel fanout
/// worker connects them.
#[tokio::test]
async fn test_board_to_alerter_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let config = alerter_config(&dir, OPS);
    let checkpoint = config.checkpoint.clone().unwrap();
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let alerter = Alerter::new(config, dispatcher.clone()).unwrap();

    let actor = BoardActor::new(daemon_config("{}"));
    let mut pages = actor.attacher(ChannelKind::Page).unwrap().attach();
    let board = BoardHandle::spawn(actor);

    let (mut writer, reader) = tokio::io::duplex(64 * 1024);
    let bridge = tokio::spawn(async move {
        while let Some(delivery) = pages.recv().await {
            if writer.write_all(delivery.text.as_bytes()).await.is_err() {
                break;
            }
        }
    });
    let alerter = tokio::spawn(alerter.run(BufReader::new(reader)));

    let agent = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
    let reply = board
        .submit("status web1.http red slow response".into(), agent)
        .await
        .unwrap();
    assert_eq!(reply, None);

    let sent = dispatcher.wait_for(1).await;
    assert_eq!(sent[0].recipient, "ops@example.com");
    let subject = sent[0].subject.clone().unwrap();
    assert!(subject.ends_with("web1:http CRITICAL (RED)"), "{subject}");
    let cookie = cookie_from_subject(&subject);

    let operator = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9));
    board
        .submit(format!("ack {cookie} 60 investigating"), operator)
        .await
        .unwrap();
    let query = board
        .submit("query web1.http".into(), operator)
        .await
        .unwrap();
    assert_eq!(query.as_deref(), Some("red slow response"));

    // closing the board closes the page channel, which stops the alerter
    board.shutdown().await;
    bridge.await.unwrap();
    alerter.await.unwrap();

    assert_eq!(dispatcher.sent().len(), 1);
    let saved = std::fs::read_to_string(&checkpoint).unwrap();
    assert!(saved.starts_with("web1|http|"), "{saved}");
    assert!(saved.contains("|acked|"), "{saved}");
}
