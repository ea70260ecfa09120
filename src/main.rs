use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use trailgrid::adapters::BinanceKlineFeed;
use trailgrid::config::AppConfig;
use trailgrid::controller::GridController;
use trailgrid::domain::InstrumentId;
use trailgrid::exchange::{build_execution_adapter, build_market_data_provider, MarketDataProvider};
use trailgrid::logging::{init_logging, init_logging_simple};
use trailgrid::signal::SignalRegistry;

#[derive(Parser)]
#[command(name = "trailgrid")]
#[command(version = "0.1.0")]
#[command(about = "Signal-gated grid position engine for perpetual futures", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller with paper execution
    Run {
        /// Directory holding default.toml and environment overrides
        #[arg(short, long, default_value = "config", env = "GRID_CONFIG_DIR")]
        config_dir: PathBuf,
    },
    /// Load and validate the configuration, then print the market set
    CheckConfig {
        #[arg(short, long, default_value = "config", env = "GRID_CONFIG_DIR")]
        config_dir: PathBuf,
    },
    /// Print the current signal for one pair
    Signal {
        /// Trading pair, e.g. DOGE-USDT
        #[arg(short, long)]
        pair: String,
        #[arg(short, long, default_value = "config", env = "GRID_CONFIG_DIR")]
        config_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config_dir } => run(&config_dir).await,
        Commands::CheckConfig { config_dir } => {
            init_logging_simple();
            check_config(&config_dir)
        }
        Commands::Signal { pair, config_dir } => {
            init_logging_simple();
            show_signal(&config_dir, &pair).await
        }
    }
}

fn load_validated(config_dir: &Path, registry: &SignalRegistry) -> anyhow::Result<AppConfig> {
    let config = AppConfig::load_from(config_dir)
        .with_context(|| format!("loading configuration from {}", config_dir.display()))?;
    if let Err(problems) = config.validate(registry) {
        for problem in &problems {
            eprintln!("  - {problem}");
        }
        return Err(anyhow!("configuration has {} problem(s)", problems.len()));
    }
    Ok(config)
}

async fn run(config_dir: &Path) -> anyhow::Result<()> {
    let registry = SignalRegistry::default();
    let config = load_validated(config_dir, &registry)?;
    init_logging(&config.logging);

    info!(
        exchange = config.exchange.kind.as_str(),
        instruments = config.instruments().len(),
        "Starting trailgrid"
    );

    let exchange = build_execution_adapter(&config.exchange);
    let market_data = build_market_data_provider(&config.exchange)?;

    let (config_tx, config_rx) = watch::channel(config.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reload_dir = config_dir.to_path_buf();
    let reload_every = Duration::from_secs(config.controller.config_update_interval_secs.max(1));
    let reloader = tokio::spawn(async move {
        let registry = SignalRegistry::default();
        let mut ticker = tokio::time::interval(reload_every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let fresh = match AppConfig::load_from(&reload_dir) {
                Ok(fresh) => fresh,
                Err(e) => {
                    warn!("Configuration reload failed: {}", e);
                    continue;
                }
            };
            if let Err(problems) = fresh.validate(&registry) {
                warn!(?problems, "Reloaded configuration rejected");
                continue;
            }
            config_tx.send_if_modified(|current| {
                if *current == fresh {
                    false
                } else {
                    *current = fresh;
                    true
                }
            });
        }
    });

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, draining engines");
        let _ = shutdown_tx.send(true);
    });

    let mut controller = GridController::new(config, exchange, market_data, registry);
    controller.run(config_rx, shutdown_rx).await;
    reloader.abort();

    for report in controller.closed_reports() {
        info!(
            instrument = %report.snapshot.instrument,
            close_type = ?report.snapshot.close_type,
            session_pnl = %report.snapshot.session_pnl,
            fees = %report.snapshot.cumulative_fee,
            "Engine summary"
        );
    }
    Ok(())
}

fn check_config(config_dir: &Path) -> anyhow::Result<()> {
    let registry = SignalRegistry::default();
    let config = load_validated(config_dir, &registry)?;

    println!("Configuration OK ({})", config_dir.display());
    println!("Signals available: {}", registry.names().join(", "));
    for instrument in config.instruments() {
        let Some(params) = config.pair_params(&instrument.pair) else {
            continue;
        };
        println!(
            "  {:<32} {:<5} x{:<3} quote={} grid_max={} open={} close={} mart={} signal={}",
            instrument.to_string(),
            params.side,
            params.leverage,
            params.amount_quote,
            params.grid_max,
            params.grid_open,
            params.grid_close,
            params.mart_open,
            params.signal.name
        );
    }
    Ok(())
}

async fn show_signal(config_dir: &Path, pair: &str) -> anyhow::Result<()> {
    let registry = SignalRegistry::default();
    let config = AppConfig::load_from(config_dir)
        .with_context(|| format!("loading configuration from {}", config_dir.display()))?;
    let params = config
        .pair_params(pair)
        .ok_or_else(|| anyhow!("no params configured for {pair}"))?;
    let instrument = config
        .instruments()
        .into_iter()
        .find(|id| id.pair == pair.to_uppercase())
        .unwrap_or_else(|| InstrumentId::new("binance_perpetual", pair));

    let evaluator = registry.resolve(&params.signal.name)?;
    let feed = BinanceKlineFeed::new(&config.exchange.rest_url)?;
    let candles = feed
        .get_recent_candles(&instrument, &params.interval, params.max_records)
        .await?;
    let price = feed.last_price(&instrument).await?;

    match evaluator.evaluate(&candles, &params.signal.signal_params()) {
        Ok(result) => println!(
            "{} {} @ {}: {} (last price {})",
            instrument,
            params.signal.name,
            result.timestamp,
            result.signal,
            price
        ),
        Err(e) => {
            error!("Signal evaluation failed: {}", e);
            return Err(e.into());
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
