use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use boardwatch::{
    config::{DaemonConfig, read_config_file},
    daemon::{BoardActor, BoardHandle, Server},
    fanout::{Connector, FanoutHandle, SystemConnector},
};
use clap::Parser;
use futures::future::join_all;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, error, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,

    /// Log every message
    #[arg(short, long)]
    verbose: bool,
}

fn init(verbose: bool) {
    let level = if verbose {
        LevelFilter::TRACE
    } else {
        LevelFilter::DEBUG
    };
    let filter = filter::Targets::new().with_targets(vec![("boardwatch", level), ("boardwatchd", level)]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init(args.verbose);
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;
    let actor = BoardActor::new(config.clone());
    let workers = spawn_workers(&config, &actor)?;
    let board = BoardHandle::spawn(actor);

    tokio::spawn(reload_on_hangup(args.file.clone(), board.clone()));

    let addr = SocketAddr::new(config.listen, config.port);
    let server = Server::bind(addr, board.clone(), config.server.clone())
        .await
        .with_context(|| format!("cannot listen on {addr}"))?;
    server.run(shutdown_signal()).await;

    info!("shutting down");
    board.shutdown().await;
    join_all(workers.iter().map(FanoutHandle::shutdown)).await;
    Ok(())
}

/// Attach one fanout worker per configured entry before the board starts
/// posting.
fn spawn_workers(config: &DaemonConfig, actor: &BoardActor) -> anyhow::Result<Vec<FanoutHandle>> {
    let connector: Arc<dyn Connector> = Arc::new(SystemConnector);
    let mut workers = vec![];
    for worker in &config.workers {
        let attacher = actor
            .attacher(worker.channel)
            .with_context(|| format!("no channel {}", worker.channel))?;
        workers.push(FanoutHandle::spawn(worker, &attacher, connector.clone())?);
        debug!("fanout worker attached to {}", worker.channel);
    }
    Ok(workers)
}

/// Re-read the host list on SIGHUP.
async fn reload_on_hangup(file: String, board: BoardHandle) {
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            error!("cannot install SIGHUP handler: {e}");
            return;
        }
    };
    while hangup.recv().await.is_some() {
        match read_config_file(&file) {
            Ok(config) => board.reload_hosts(config.hosts).await,
            Err(e) => error!("reload failed: {e:#}"),
        }
    }
}

async fn shutdown_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            error!("cannot install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}
