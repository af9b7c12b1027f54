//! Fine-tune engine - entry point.
//!
//! Starts the HTTP adapter over a SQLite-backed run controller.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use finetune_core::server::{self, AppState};
use finetune_core::{EngineConfig, RunController, SqliteRunStore};
use finetune_training::RunLayout;

const DEFAULT_LOG_FILTER: &str = "finetune_core=debug,info";

#[derive(Parser, Debug)]
#[command(name = "finetune-engine")]
#[command(about = "Fine-tuning run orchestration engine", long_about = None)]
#[command(version)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind the HTTP API to
    #[arg(short, long)]
    address: Option<std::net::SocketAddr>,

    /// Root directory for run artifacts and the default database
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn init_tracing(config: &EngineConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(config.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER))
    });
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = EngineConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(address) = args.address {
        config.server.address = address;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    init_tracing(&config);

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data directory {}", config.data_dir.display()))?;
    let database = config.database_path();
    let store = SqliteRunStore::open(&database)
        .with_context(|| format!("Failed to open run database {}", database.display()))?;
    info!(database = %database.display(), data_dir = %config.data_dir.display(), "Run store ready");

    let controller = Arc::new(
        RunController::new(Arc::new(store), RunLayout::new(config.data_dir.clone()))
            .with_limits(config.limits()),
    );

    let listener = tokio::net::TcpListener::bind(config.server.address)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.address))?;
    server::serve(listener, AppState::new(Arc::clone(&controller)), shutdown_signal())
        .await
        .context("HTTP server error")?;

    let failures = controller.shutdown().await;
    for failure in &failures {
        error!(run_id = %failure.run_id, error = %failure.error, "Run surfaced a store failure");
    }
    if !failures.is_empty() {
        anyhow::bail!("{} run(s) surfaced store failures", failures.len());
    }
    info!("Fine-tune engine stopped");
    Ok(())
}
