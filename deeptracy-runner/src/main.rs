//! Deeptracy Runner
//!
//! Orchestrates repository analyses as a tree of builds executed on a pool
//! of container-backed workers.
//!
//! Architecture:
//! - Configuration: Load settings from environment, overridable on the command line
//! - Runtime: Podman adapter behind the container runtime trait
//! - Pool: Fixed set of worker slots with on-demand containers
//! - Scheduler: Build graph engine (trigger, fan-out/fan-in, cancellation)
//! - Expander: Manifest parsing into task specs
//! - Services: The launch, bootstrap and analyze stages
//!
//! A launch build registers the analysis with the backend and triggers a
//! bootstrap build, which checks the repository out and fans out one
//! analyze build per task declared in its manifests.

mod commands;
mod config;
mod expander;
mod pool;
mod runtime;
mod scheduler;
mod secrets;
mod service;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::{Commands, handle_command};
use crate::config::Config;

#[derive(Parser)]
#[command(name = "deeptracy-runner")]
#[command(about = "Deeptracy analysis orchestrator", long_about = None)]
struct Cli {
    /// Backend URL (overrides DEEPTRACY_BACKEND_URL)
    #[arg(long, global = true)]
    backend_url: Option<String>,

    /// Number of worker slots (overrides DEEPTRACY_WORKER_COUNT)
    #[arg(long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deeptracy_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    info!("Starting Deeptracy Runner");

    let config = load_config(&cli)?;
    info!(
        "Loaded configuration: workers={}, backend_url={}, allowed_images={:?}",
        config.worker_count, config.backend_url, config.allowed_images
    );

    handle_command(cli.command, &config).await
}

/// Loads configuration from environment variables with fallback to defaults
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load config from environment ({:#}), using defaults", e);
            Config::default()
        }
    };

    if let Some(url) = &cli.backend_url {
        config.backend_url = url.clone();
    }
    if let Some(workers) = cli.workers {
        config.worker_count = workers;
    }

    config.validate()?;
    Ok(config)
}
