use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use boardwatch::{
    alert::{Alerter, CommandDispatcher, MatchContext, RuleSet, dry_run, rule_defaults},
    color::Color,
    config::{AlerterConfig, read_alerter_config},
    util::now_secs,
};
use clap::Parser;
use tokio::io::BufReader;
use tracing::{level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,

    /// Print who would be alerted about HOST.SERVICE and exit
    #[arg(long, value_name = "HOST.SERVICE")]
    test: Option<String>,

    /// Color assumed with --test
    #[arg(long, default_value = "red")]
    color: String,

    /// Minutes the problem has lasted, with --test
    #[arg(long, default_value_t = 0)]
    duration: i64,

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
    let filter = filter::Targets::new()
        .with_targets(vec![("boardwatch", level), ("boardwatch_alerter", level)]);
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

    let config = read_alerter_config(&args.file)?;

    if let Some(target) = &args.test {
        return print_recipients(&config, target, &args.color, args.duration);
    }

    let dispatcher = CommandDispatcher::new(
        &config.mail_command,
        Duration::from_secs(config.script_timeout_secs),
    );
    let alerter = Alerter::new(config, Arc::new(dispatcher))?;
    alerter.run(BufReader::new(tokio::io::stdin())).await;
    Ok(())
}

fn print_recipients(
    config: &AlerterConfig,
    target: &str,
    color: &str,
    duration_mins: i64,
) -> anyhow::Result<()> {
    let (host, test) = target
        .rsplit_once('.')
        .context("expected HOST.SERVICE")?;
    let host = host.replace(',', ".");
    let color = Color::parse(color).with_context(|| format!("unknown color {color}"))?;
    let rules = RuleSet::load(&config.rules, &rule_defaults(config))?;
    let ctx = MatchContext::new(now_secs(), config.alert_colors);

    let lines = dry_run(&rules, &host, test, color, duration_mins * 60, &ctx);
    if lines.is_empty() {
        println!("no recipients for {host}.{test}");
    }
    for line in lines {
        println!("{line}");
    }
    Ok(())
}
