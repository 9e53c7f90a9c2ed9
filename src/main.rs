//! assignment-repair: consistency daemon for volunteer assignments
//!
//! Without a subcommand the binary runs the repair scheduler on its interval
//! and serves the operator API until interrupted. Subcommands run a single
//! operation against the configured store and exit.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use assignment_repair::api;
use assignment_repair::cli::{execute_command, Commands};
use assignment_repair::config::{Config, StoreBackend};
use assignment_repair::RepairService;

#[derive(Parser)]
#[command(name = "assignment-repair")]
#[command(about = "Detects and repairs corrupt volunteer assignment state")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "assignment-repair.toml", env = "ASSIGNMENT_REPAIR_CONFIG")]
    config: PathBuf,

    /// SQLite database path (overrides config file)
    #[arg(long, env = "ASSIGNMENT_REPAIR_DB")]
    db_path: Option<PathBuf>,

    /// Use the in-memory store instead of SQLite
    #[arg(long)]
    memory: bool,

    /// HTTP API port (overrides config file)
    #[arg(long, env = "ASSIGNMENT_REPAIR_HTTP_PORT")]
    http_port: Option<u16>,

    /// Seconds between passes (overrides config file)
    #[arg(long, env = "ASSIGNMENT_REPAIR_INTERVAL_SECS")]
    interval_secs: Option<u64>,

    /// Plan repairs without writing them
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("assignment_repair=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::load_or_default(&cli.config)?;
    if !cli.config.exists() {
        info!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    // Apply CLI overrides
    if let Some(path) = cli.db_path {
        config.store.path = path;
    }
    if cli.memory {
        config.store.backend = StoreBackend::Memory;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(secs) = cli.interval_secs {
        config.scheduler.interval_secs = secs;
    }
    if cli.dry_run {
        config.repair.dry_run = true;
    }
    config.validate()?;

    let service = RepairService::open(config.clone())?;

    if let Some(command) = cli.command {
        match execute_command(&service, command).await {
            Ok(output) => {
                println!("{}", output);
                return Ok(());
            }
            Err(e) => {
                eprintln!("Error: {:#}", e);
                std::process::exit(1);
            }
        }
    }

    let service = Arc::new(service);

    let scheduler = if config.scheduler.enabled {
        Some(service.spawn_scheduler())
    } else {
        info!("Scheduler is disabled");
        None
    };

    if config.api.enabled {
        let addr: SocketAddr = format!("{}:{}", config.api.bind, config.api.http_port).parse()?;
        api::serve(service.clone(), addr, shutdown_signal()).await?;
    } else {
        shutdown_signal().await;
    }

    service.shutdown();
    if let Some(handle) = scheduler {
        handle.await?;
    }

    info!("assignment-repair stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");
}
