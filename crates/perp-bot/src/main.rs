//! perp-bot: AI-assisted perpetual futures trading agent.
//!
//! Usage:
//!   perp-bot [OPTIONS]
//!
//! Options:
//!   -s, --symbol <SYMBOL>     Instrument override (e.g. BTCUSDT)
//!   -i, --interval <INTERVAL> Candle interval override (e.g. 5m, 1h)
//!       --paper               Force paper trading
//!       --no-trade            Analyse only, never submit orders

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use perp_common::Interval;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use perp_bot::config::BotConfig;
use perp_bot::engine::Engine;
use perp_bot::events;
use perp_bot::history::HistoryStore;
use perp_bot::metrics::{spawn_metrics_server, Metrics};
use perp_bot::reasoning::{ReasoningApi, ReasoningClient};
use perp_bot::tools::{spawn_tools_server, ToolsContext};
use perp_bot::venue::{PaperVenue, VenueApi, VenueClient};

/// Starting equity for the simulated paper account.
const PAPER_INITIAL_BALANCE: f64 = 10_000.0;

#[derive(Parser, Debug)]
#[command(name = "perp-bot")]
#[command(about = "AI-assisted perpetual futures trading agent")]
#[command(version)]
struct Args {
    /// Instrument to trade (overrides PERP_SYMBOL)
    #[arg(short, long)]
    symbol: Option<String>,

    /// Candle interval, e.g. 5m or 1h (overrides PERP_INTERVAL)
    #[arg(short, long)]
    interval: Option<String>,

    /// Force paper trading regardless of environment
    #[arg(long)]
    paper: bool,

    /// Disable order submission (analysis only)
    #[arg(long)]
    no_trade: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    // A missing .env file is fine; anything else is worth a warning.
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: failed to load .env: {e}");
        }
    }

    let args = Args::parse();
    let interval = match args.interval.as_deref() {
        Some(raw) => Some(
            Interval::parse(raw)
                .with_context(|| format!("unrecognised interval {raw:?}"))?,
        ),
        None => None,
    };

    let mut config = BotConfig::from_env();
    config.apply_cli_overrides(args.symbol, interval, args.paper, args.no_trade);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    config.validate().context("configuration invalid")?;
    info!("perp-bot starting: {}", config.summary());
    events::system("bot", "start");

    // Venue: live client, optionally wrapped by the paper executor.
    let live = Arc::new(VenueClient::new(config.venue.clone()));
    let venue: Arc<dyn VenueApi> = if config.trading.paper_trading {
        info!("paper trading enabled, order writes are simulated");
        Arc::new(PaperVenue::new(live, PAPER_INITIAL_BALANCE))
    } else {
        live
    };

    let reasoning: Arc<dyn ReasoningApi> =
        Arc::new(ReasoningClient::new(config.reasoning.clone()));
    let history = Arc::new(HistoryStore::connect(&config.history).await);
    let metrics = Metrics::new();

    let metrics_server = spawn_metrics_server(Arc::clone(&metrics), config.servers.metrics_port);

    let engine = Engine::new(
        config.clone(),
        Arc::clone(&venue),
        Arc::clone(&reasoning),
        Arc::clone(&history),
        Arc::clone(&metrics),
    );

    let tools_server = if config.servers.tools_port != 0 {
        let ctx = Arc::new(ToolsContext {
            cfg: config.clone(),
            venue: Arc::clone(&venue),
            reasoning: Arc::clone(&reasoning),
            buffer: engine.candle_buffer(),
            risk: engine.risk_gate(),
        });
        Some(spawn_tools_server(ctx, config.servers.tools_port))
    } else {
        None
    };

    let mut engine_task = tokio::spawn(Arc::clone(&engine).run());

    // Run until a signal arrives or the engine dies on its own (startup
    // failure, fatal backfill).
    let engine_result = tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received, stopping gracefully");
            engine.stop();
            engine_task.await
        }
        result = &mut engine_task => result,
    };

    // Ordered teardown: loop and buffer are already down, then history,
    // tools server, metrics server.
    history.close().await;
    if let Some(handle) = tools_server {
        handle.abort();
    }
    metrics_server.abort();
    events::system("bot", "stop");

    match engine_result {
        Ok(Ok(())) => {
            info!("perp-bot stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("engine exited with error: {e}");
            events::system_error("engine", &e.to_string());
            Err(e.into())
        }
        Err(e) => {
            warn!("engine task join failed: {e}");
            Err(e.into())
        }
    }
}

/// Resolve on the first interrupt/terminate/quit signal.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut quit = signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
            _ = quit.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
