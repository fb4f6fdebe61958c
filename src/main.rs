//! `simex-server`: the exchange behind its REST and WebSocket edges.

use clap::Parser;
use simex::api::{WsHub, router};
use simex::config::ExchangeConfig;
use simex::exchange::Exchange;
use simex::time::{TimeManager, TimeMode};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "simex-server", about = "Simulated exchange for backtesting")]
struct Args {
    /// TOML configuration file. Without it a dev config with BTCUSDT and
    /// ETHUSDT is used.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the listen address from the config.
    #[arg(long)]
    bind: Option<String>,

    /// Clock mode: live or backtest.
    #[arg(long, default_value = "live")]
    mode: String,

    /// Virtual start time (ms since epoch) when `--mode backtest`.
    #[arg(long)]
    start_time: Option<u64>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => match ExchangeConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("failed to load config {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => ExchangeConfig::dev_default(),
    };

    let time = match args.mode.as_str() {
        "backtest" => Arc::new(TimeManager::backtest(args.start_time.unwrap_or(0))),
        "live" => Arc::new(TimeManager::new(TimeMode::Live)),
        other => {
            error!("unknown mode '{other}', expected live or backtest");
            std::process::exit(1);
        }
    };

    let exchange = Exchange::new(&config, time);
    exchange.start();
    let hub = WsHub::new(&exchange);
    let app = router(exchange.clone(), hub);

    let bind = args.bind.unwrap_or_else(|| config.server.bind.clone());
    let listener = match tokio::net::TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("cannot bind {bind}: {e}");
            std::process::exit(1);
        }
    };
    info!(%bind, symbols = config.symbols.len(), "serving");

    let shutdown_exchange = exchange.clone();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    });
    if let Err(e) = serve.await {
        error!("server error: {e}");
    }
    shutdown_exchange.shutdown();
}
