//! Talking to the board over TCP the way agents and tools do

use std::net::{Ipv4Addr, SocketAddr};

use boardwatch::config::DaemonConfig;
use boardwatch::daemon::{BoardActor, BoardHandle, Server};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::helpers::daemon_config;

struct Running {
    addr: SocketAddr,
    board: BoardHandle,
    stop: oneshot::Sender<()>,
    server: JoinHandle<()>,
}

async fn start(config: DaemonConfig) -> Running {
    let server_config = config.server.clone();
    let board = BoardHandle::spawn(BoardActor::new(config));
    let server = Server::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), board.clone(), server_config)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(server.run(async move {
        let _ = stopped.await;
    }));
    Running {
        addr,
        board,
        stop,
        server,
    }
}

impl Running {
    async fn send(&self, text: &str) -> String {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        stream.write_all(text.as_bytes()).await.unwrap();
        stream.shutdown().await.unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        reply
    }

    async fn stop(self) {
        let _ = self.stop.send(());
        self.server.await.unwrap();
        self.board.shutdown().await;
    }
}

#[tokio::test]
async fn test_combo_board_and_disable() {
    let board = start(daemon_config("{}")).await;

    let combo = "combo\nstatus web1.http yellow slow\nresponse time 4s\n\nstatus web1.conn green up\n";
    assert_eq!(board.send(combo).await, "");
    assert_eq!(
        board.send("board host=^web1$ fields=hostname,testname,color,line1").await,
        "web1|http|yellow|yellow slow\nweb1|conn|green|green up\n"
    );

    assert_eq!(board.send("disable web1.http 30 maintenance").await, "");
    assert_eq!(
        board.send("xymondboard color=blue fields=hostname,testname,dismsg").await,
        "web1|http|maintenance\n"
    );

    assert_eq!(board.send("enable web1.http").await, "");
    assert_eq!(board.send("board color=blue fields=hostname").await, "");

    board.stop().await;
}

#[tokio::test]
async fn test_unknown_hosts_land_on_ghost_list() {
    let config = daemon_config(
        r#"{ "store": { "ghost_policy": "log" }, "hosts": [ { "name": "web1" } ] }"#,
    );
    let board = start(config).await;

    assert_eq!(board.send("status db9.cpu green idle").await, "");
    assert_eq!(board.send("status web1.cpu green idle").await, "");

    let ghosts = board.send("ghostlist").await;
    assert!(ghosts.starts_with("db9|127.0.0.1|"), "{ghosts}");
    assert_eq!(ghosts.lines().count(), 1);
    assert_eq!(board.send("board fields=hostname,testname").await, "web1|cpu\n");

    let stats = board.board.stats().await.unwrap();
    assert_eq!(stats.counters.ghosts, 1);
    assert_eq!(stats.hosts, 1);

    board.stop().await;
}

#[tokio::test]
async fn test_garbage_gets_no_reply() {
    let board = start(daemon_config("{}")).await;

    assert_eq!(board.send("frobnicate web1").await, "");
    assert_eq!(board.send("status web1.http purplish broken").await, "");
    assert_eq!(board.send("query web1.http").await, "");

    let stats = board.board.stats().await.unwrap();
    assert_eq!(stats.counters.messages, 3);
    // a query for a record that does not exist is not an error
    assert_eq!(stats.counters.dropped, 2);

    board.stop().await;
}
