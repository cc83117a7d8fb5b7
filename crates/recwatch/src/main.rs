//! recwatch: periodic record-collection observer.
//!
//! Usage:
//!   recwatch [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>           Config file path (default: config/recwatch.toml)
//!   --store-url <URL>             Store HTTP URL (overrides STORE_URI)
//!   --database <NAME>             Database name (overrides DB_NAME)
//!   --collection <NAMES>          Comma-separated collections (overrides COLLECTION_NAME)
//!   --schedule <EXPR>             Recurrence, e.g. "@every 1m" or "*/5 * * * *"

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use recwatch_common::{ClickHouseClient, CollectionGateway};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use recwatch::config::{CliOverrides, WatchConfig};
use recwatch::events::{EventSink, TracingSink};
use recwatch::scheduler::{ObservationScheduler, WatchTarget};
use recwatch::stats::{join_health_logger, spawn_health_logger, WatchStats};

/// CLI arguments for recwatch.
#[derive(Parser, Debug)]
#[command(name = "recwatch")]
#[command(about = "Periodic record-collection observer")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config/recwatch.toml")]
    config: PathBuf,

    /// Store HTTP URL (overrides config file and STORE_URI)
    #[arg(long)]
    store_url: Option<String>,

    /// Database name (overrides config file and DB_NAME)
    #[arg(long)]
    database: Option<String>,

    /// Comma-separated collections to watch (e.g., "users,orders")
    #[arg(long, value_delimiter = ',')]
    collection: Option<Vec<String>>,

    /// Scheduler recurrence (e.g., "@every 1m", "*/5 * * * *")
    #[arg(long)]
    schedule: Option<String>,

    /// Seconds between differ polls
    #[arg(long)]
    poll_interval_secs: Option<u64>,

    /// Numeric column to use as a high-water mark for new-record detection
    #[arg(long)]
    watermark_column: Option<String>,

    /// Log level: trace, debug, info, warn, error
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    // Load environment variables from .env file (if present)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound) {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    let args = Args::parse();

    let config_found = args.config.exists();
    let mut config = if config_found {
        WatchConfig::from_file(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?
    } else {
        WatchConfig::default()
    };

    config.apply_env_overrides();
    config.apply_cli_overrides(CliOverrides {
        store_url: args.store_url,
        database: args.database,
        collections: args.collection,
        schedule: args.schedule,
        poll_interval_secs: args.poll_interval_secs,
        watermark_column: args.watermark_column,
        log_level: args.log_level,
    });

    init_logging(&config.log_level)?;
    if !config_found {
        warn!(
            "Config file not found at {:?}, using defaults and environment",
            args.config
        );
    }

    config.validate()?;
    let recurrence = config.recurrence()?;

    info!("Starting recwatch");
    info!("Collections: {:?}", config.collections);
    info!("Schedule: {}", recurrence);

    let db = ClickHouseClient::new(config.clickhouse()?);
    info!("Testing store connection at {}...", db.config().url);
    db.ping()
        .await
        .context("Initial connection to the store failed")?;
    info!("Store connection successful");

    let stats = Arc::new(WatchStats::new());
    let sink: Arc<dyn EventSink> = Arc::new(TracingSink);

    let mut targets = Vec::with_capacity(config.collections.len());
    for name in &config.collections {
        let mut gateway = db.gateway(name)?;
        if config.differ.watermark_column.is_none() {
            match db.sorting_key(name).await {
                Ok(Some(key)) => {
                    info!("Ordering {} snapshots by sorting key ({})", name, key);
                    gateway = gateway.with_order_by(key);
                }
                Ok(None) => warn!(
                    "{} has no sorting key; row order may vary between snapshots, \
                     consider setting watermark_column",
                    name
                ),
                Err(e) => warn!("Failed to look up sorting key for {}: {}", name, e),
            }
        }
        let gateway: Arc<dyn CollectionGateway> = Arc::new(gateway);
        targets.push(WatchTarget::new(
            gateway,
            Arc::clone(&sink),
            Arc::clone(&stats),
            config.differ.clone(),
        ));
    }

    let scheduler = ObservationScheduler::new(recurrence, targets, Arc::clone(&stats));
    scheduler.start();

    let health_cancel = CancellationToken::new();
    let health_handle = spawn_health_logger(
        Arc::clone(&stats),
        config.health_log_interval,
        health_cancel.clone(),
    );

    info!("Scheduler running. Press Ctrl+C to stop.");
    wait_for_shutdown_signal().await?;

    info!("Initiating graceful shutdown...");
    health_cancel.cancel();
    join_health_logger(health_handle).await;

    if !scheduler.shutdown(config.shutdown_grace).await {
        warn!("Shutdown timeout exceeded, forcing exit");
    }

    stats.log_stats();
    info!("Shutdown complete");
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let log_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
