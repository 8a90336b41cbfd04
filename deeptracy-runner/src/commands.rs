//! Commands module
//!
//! Defines the runner's subcommands and their handlers.

use anyhow::{Context, Result};
use clap::Subcommand;
use deeptracy_client::BackendClient;
use deeptracy_core::domain::build::BuildStatus;
use deeptracy_core::domain::property::{Property, PropertySet};
use deeptracy_core::domain::worker::PullPolicy;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Config;
use crate::expander::{ExpandContext, ManifestSource};
use crate::pool::{PoolSettings, WorkerPool};
use crate::runtime::PodmanRuntime;
use crate::runtime::podman::check_podman_available;
use crate::scheduler::{BuildEngine, EngineSettings};
use crate::secrets::{FileSecrets, NoSecrets, SecretsProvider};
use crate::service::{DEFAULT_COMMIT, StageSettings, StandardExecutionService};

/// Delay before the first re-queue of a failed worker acquisition
const PROVISION_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Analyze a repository and wait for the pipeline to finish
    Launch {
        /// Repository URL to clone
        #[arg(long)]
        repo: String,

        /// Commit, branch or tag to check out
        #[arg(long, default_value = DEFAULT_COMMIT)]
        commit: String,

        /// Reuse an analysis already registered with the backend
        #[arg(long)]
        analysis_id: Option<String>,

        /// Address notified by the backend when the analysis completes
        #[arg(long)]
        notify: Option<String>,
    },
    /// Print the task specs a manifest expands to
    Expand {
        /// Manifest file
        manifest: PathBuf,

        /// Repository path injected into each spec's options
        #[arg(long, default_value = "/workspace/repo")]
        repo_path: String,
    },
}

/// Handle a CLI command
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Launch {
            repo,
            commit,
            analysis_id,
            notify,
        } => launch(config, repo, commit, analysis_id, notify).await,
        Commands::Expand {
            manifest,
            repo_path,
        } => expand(config, &manifest, repo_path).await,
    }
}

async fn launch(
    config: &Config,
    repo: String,
    commit: String,
    analysis_id: Option<String>,
    notify: Option<String>,
) -> Result<()> {
    check_podman_available(config.container_url.as_deref()).await?;

    let runtime = Arc::new(PodmanRuntime::new(
        config.container_url.clone(),
        config.workspace.clone(),
        config.secrets_dir.clone(),
    ));
    let pool = Arc::new(WorkerPool::new(
        runtime,
        PoolSettings {
            size: config.worker_count,
            pull_policy: PullPolicy::from_autopull(config.autopull),
            acquire_timeout: config.acquire_timeout,
            idle_timeout: config.idle_timeout,
        },
    ));
    let reaper = Arc::clone(&pool).spawn_reaper(config.reap_interval());

    let secrets: Arc<dyn SecretsProvider> = match &config.secrets_dir {
        Some(dir) => Arc::new(FileSecrets::new(dir)),
        None => Arc::new(NoSecrets),
    };
    let service = StandardExecutionService::new(
        BackendClient::new(config.backend_url.clone()),
        StageSettings {
            checkout_image: config.checkout_image.clone(),
            task_command: config.task_command.clone(),
            allow_list: config.allow_list()?,
            default_manifest: config.default_manifest.clone(),
        },
        secrets,
    );
    let engine = BuildEngine::new(
        Arc::clone(&pool),
        Arc::new(service),
        EngineSettings {
            provision_retries: config.provision_retries,
            retry_delay: PROVISION_RETRY_DELAY,
        },
    );

    info!("Services initialized");

    let mut properties = PropertySet::new()
        .with(Property::Repo, repo.as_str())?
        .with(Property::Commit, commit.as_str())?;
    if let Some(id) = analysis_id {
        properties.insert(Property::AnalysisId, id)?;
    }
    if let Some(notify) = notify {
        properties.insert(Property::Notify, notify)?;
    }

    let root = engine.launch(properties)?;

    let outcome = tokio::select! {
        outcome = root.wait() => outcome?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling build {}", root.id());
            engine.cancel(root.id())?;
            root.wait().await?
        }
    };

    reaper.abort();
    pool.shutdown().await;

    match outcome.status {
        BuildStatus::Succeeded => {
            info!(
                "Analysis {} of {} succeeded",
                outcome.properties.analysis_id().unwrap_or("?"),
                repo
            );
            Ok(())
        }
        status => anyhow::bail!(
            "Analysis of {} ended {}: {}",
            repo,
            status,
            outcome.error_message.as_deref().unwrap_or("no error recorded")
        ),
    }
}

async fn expand(config: &Config, manifest: &std::path::Path, repo_path: String) -> Result<()> {
    let ctx = ExpandContext {
        repo_path,
        allow_list: config.allow_list()?,
    };

    let source = ManifestSource::from_file(manifest).await;
    let text = source.text?;
    let mut specs = crate::expander::expand(&text, &source.origin, &ctx)?;

    for spec in specs.by_ref() {
        let line = serde_json::to_string(&spec).context("Failed to encode task spec")?;
        println!("{}", line);
    }

    if !specs.rejections().is_empty() {
        warn!(
            "{} project(s) of {} use images outside the allow-list",
            specs.rejections().len(),
            specs.origin()
        );
    }

    Ok(())
}
