//! Property-based tests for invariants using proptest
//!
//! These tests verify that certain properties hold true for all inputs:
//! - Escaped text survives a channel field unchanged
//! - Sequence gaps are counted correctly, also across the wrap
//! - A flapping record never gets less severe
//! - Alert rule host lists do not depend on their order

use boardwatch::alert::{MatchContext, RuleDefaults, RuleSet, dry_run};
use boardwatch::channel::message::{MAX_SEQ, SeqCheck, SequenceTracker, next_seq};
use boardwatch::channel::{ChannelMessage, Envelope};
use boardwatch::color::{Color, ColorSet};
use boardwatch::config::StoreConfig;
use boardwatch::store::{StatusReport, StatusStore};
use boardwatch::util::{nldecode, nlencode, parse_duration_mins};
use proptest::prelude::*;

fn report(color: Color) -> StatusReport {
    StatusReport {
        host: "web1".to_string(),
        test: "http".to_string(),
        color,
        message: format!("{color} check"),
        lifetime_mins: None,
        group: None,
        client_ts: None,
    }
}

fn report_color() -> impl Strategy<Value = Color> {
    prop::sample::select(vec![Color::Green, Color::Yellow, Color::Red])
}

// Property: anything nlencoded fits in one field and decodes back
proptest! {
    #[test]
    fn prop_nlencode_roundtrip(text in any::<String>()) {
        let encoded = nlencode(&text);
        prop_assert!(!encoded.contains('|'));
        prop_assert!(!encoded.contains('\n'));
        prop_assert_eq!(nldecode(&encoded), text);
    }
}

// Property: encoded fields come back at the same index
proptest! {
    #[test]
    fn prop_fields_keep_their_position(
        fields in prop::collection::vec(any::<String>(), 0..14),
        seq in 1u32..=MAX_SEQ,
    ) {
        let envelope = fields
            .iter()
            .fold(Envelope::new("page", "web1", "10.0.0.1"), |e, f| e.field(nlencode(f)));
        let msg = ChannelMessage::decode(&envelope.encode(seq, 1_700_000_000, 0)).unwrap();

        prop_assert_eq!(msg.seq, seq);
        prop_assert_eq!(msg.fields.len(), fields.len());
        for (i, field) in fields.iter().enumerate() {
            prop_assert_eq!(&nldecode(msg.field(i).unwrap()), field);
        }
    }
}

// Property: skipping k messages is reported as a gap of k, wrap or not
proptest! {
    #[test]
    fn prop_sequence_gap_counts_skipped(start in 1u32..=MAX_SEQ, skipped in 0u32..1000) {
        let mut seq = start;
        for _ in 0..=skipped {
            seq = next_seq(seq);
        }
        prop_assert!(seq >= 1 && seq <= MAX_SEQ);

        let mut tracker = SequenceTracker::default();
        prop_assert_eq!(tracker.observe(start), SeqCheck::First);
        let expected = if skipped == 0 { SeqCheck::InOrder } else { SeqCheck::Gap(skipped) };
        prop_assert_eq!(tracker.observe(seq), expected);
        prop_assert_eq!(tracker.observe(seq), SeqCheck::Repeated);
    }
}

// Property: while a record flaps its color only ever gets worse
proptest! {
    #[test]
    fn prop_flapping_never_improves(colors in prop::collection::vec(report_color(), 1..60)) {
        let mut store = StatusStore::new(StoreConfig::default(), &[]);
        let mut now = 1_700_000_000;
        let mut before = None;

        for color in colors {
            store.apply_report(&report(color), "10.0.0.1", now).unwrap();
            let record = store.record("web1", "http").unwrap();
            if record.flapping {
                if let Some(before) = before {
                    prop_assert!(record.color >= before);
                }
                prop_assert!(record.color >= color);
            } else {
                prop_assert_eq!(record.color, color);
            }
            before = Some(record.color);
            now += 10;
        }
    }
}

// Property: a host list matches the same hosts in any order
proptest! {
    #[test]
    fn prop_host_list_order_is_irrelevant(
        (hosts, shuffled) in prop::collection::vec("[a-z]{1,5}[0-9]", 1..6)
            .prop_flat_map(|hosts| (Just(hosts.clone()), Just(hosts).prop_shuffle())),
        candidate in "[a-z]{1,5}[0-9]",
    ) {
        let defaults = RuleDefaults { repeat_secs: 1800, colors: ColorSet::DEFAULT_ALERT };
        let ctx = MatchContext::new(1_700_000_000, ColorSet::DEFAULT_ALERT);
        let ordered = RuleSet::parse(&format!("HOST={}\n MAIL ops\n", hosts.join(",")), &defaults);
        let reordered = RuleSet::parse(&format!("HOST={}\n MAIL ops\n", shuffled.join(",")), &defaults);

        for host in hosts.iter().chain(std::iter::once(&candidate)) {
            let expected = dry_run(&ordered, host, "http", Color::Red, 0, &ctx);
            prop_assert_eq!(dry_run(&reordered, host, "http", Color::Red, 0, &ctx), expected.clone());
            prop_assert_eq!(expected.is_empty(), !hosts.contains(host));
        }
    }
}

// Property: duration units scale minutes
proptest! {
    #[test]
    fn prop_duration_units(n in 0i64..10_000) {
        prop_assert_eq!(parse_duration_mins(&n.to_string()).unwrap(), n);
        prop_assert_eq!(parse_duration_mins(&format!("{n}m")).unwrap(), n);
        prop_assert_eq!(parse_duration_mins(&format!("{n}h")).unwrap(), n * 60);
        prop_assert_eq!(parse_duration_mins(&format!("{n}d")).unwrap(), n * 24 * 60);
    }
}
