//! Board channel relayed to a network peer by a fanout worker

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use boardwatch::channel::message::read_message;
use boardwatch::channel::{ChannelKind, ChannelMessage};
use boardwatch::daemon::{BoardActor, BoardHandle};
use boardwatch::fanout::{FanoutHandle, SystemConnector};
use pretty_assertions::assert_eq;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::helpers::daemon_config;

const AGENT: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
const ADMIN: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

async fn next_message(peer: &mut BufReader<TcpStream>) -> ChannelMessage {
    let text = timeout(Duration::from_secs(5), read_message(peer))
        .await
        .expect("peer got nothing")
        .unwrap()
        .expect("connection closed");
    ChannelMessage::decode(&text).unwrap()
}

#[tokio::test]
async fn test_status_changes_reach_network_peer() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let address = listener.local_addr().unwrap();
    let config = daemon_config(&format!(
        r#"{{ "workers": [ {{ "channel": "stachg",
            "peers": [ {{ "type": "network", "address": "{address}" }} ] }} ] }}"#
    ));

    let actor = BoardActor::new(config.clone());
    let attacher = actor.attacher(ChannelKind::Stachg).unwrap();
    let worker = FanoutHandle::spawn(&config.workers[0], &attacher, Arc::new(SystemConnector)).unwrap();
    let board = BoardHandle::spawn(actor);

    board
        .submit("status web1.http red slow response".into(), AGENT)
        .await
        .unwrap();
    let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .unwrap()
        .unwrap();
    let mut peer = BufReader::new(stream);

    let msg = next_message(&mut peer).await;
    assert_eq!(msg.marker, "stachg");
    assert_eq!(msg.key, "web1");
    assert_eq!(msg.field(1), Some("web1"));
    assert_eq!(msg.field(2), Some("http"));
    assert_eq!(msg.field(4), Some("red"));
    assert_eq!(msg.body, "red slow response");

    // same color again is no state change
    board
        .submit("status web1.http red still slow".into(), AGENT)
        .await
        .unwrap();
    board.submit("status web1.http green ok".into(), AGENT).await.unwrap();
    let msg = next_message(&mut peer).await;
    assert_eq!(msg.field(4), Some("green"));
    assert_eq!(msg.field(5), Some("red"));

    board.submit("drop web1".into(), ADMIN).await.unwrap();
    let msg = next_message(&mut peer).await;
    assert_eq!(msg.marker, "drophost");
    assert_eq!(msg.field(0), Some("web1"));

    let stats = worker.stats().await.unwrap();
    assert_eq!(stats.received, 3);
    assert_eq!(stats.lost, 0);

    worker.shutdown().await;
    board.shutdown().await;
}
