//! ticker-bot entrypoint.
//!
//! Reads newline-delimited JSON signals from stdin and dispatches them
//! to the engine. This is the paper-trading harness; a live deployment
//! swaps the gateway implementation behind the same seam.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use ticker_bot::config::BotConfig;
use ticker_bot::engine::Engine;
use ticker_bot::gateway::paper::PaperGateway;
use ticker_bot::signal::Signal;

#[derive(Debug, Parser)]
#[command(name = "ticker-bot", about = "Equity position execution and risk supervision")]
struct Args {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = "config/ticker.toml")]
    config: String,

    /// Override the configured log level.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = match BotConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Falling back to default config: {e:#}");
            BotConfig::default()
        }
    };
    config.apply_env_overrides();
    config.apply_cli_overrides(args.log_level);
    config.validate()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone())),
        )
        .init();

    info!(config = %args.config, "ticker-bot starting");

    let gateway = Arc::new(PaperGateway::new());
    let engine = Engine::new(config, gateway);

    let mut handles = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("stdin read failed")? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Signal>(&line) {
            Ok(signal) => handles.push(engine.dispatch(signal)),
            Err(e) => warn!(error = %e, "Unparseable signal line"),
        }
    }

    for handle in handles {
        match handle.await {
            Ok(outcome) => info!(outcome = ?outcome, "Signal settled"),
            Err(e) => error!(error = %e, "Signal task panicked"),
        }
    }

    let status = engine.status();
    info!(
        open_positions = status.positions.len(),
        trades = status.ledger.trades,
        wins = status.ledger.wins,
        total_pnl = %status.ledger.total_pnl,
        "ticker-bot finished"
    );
    Ok(())
}
