//! Launch stage
//!
//! Root of every pipeline run. Holds no worker: it only talks to the
//! backend and waits for bootstrap. Once bootstrap is terminal the analysis
//! is closed on the backend with its status and collected dependencies.

use deeptracy_client::analysis;
use deeptracy_core::domain::build::{BuildStatus, StageKind};
use deeptracy_core::domain::property::{Property, PropertyValue};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use super::error::StageError;
use super::execution::StandardExecutionService;
use crate::runtime::podman::WORKSPACE_MOUNT;
use crate::scheduler::{EngineError, StageContext};

/// Commit checked out when the trigger names none
pub const DEFAULT_COMMIT: &str = "HEAD";

/// Keys bootstrap inherits from launch
const BOOTSTRAP_SEED: [Property; 5] = [
    Property::Repo,
    Property::Commit,
    Property::Notify,
    Property::AnalysisId,
    Property::RepoPath,
];

pub(super) async fn run(
    service: &StandardExecutionService,
    ctx: &mut StageContext,
) -> Result<(), StageError> {
    let repo = ctx.require_text(Property::Repo)?;

    if !ctx.props().contains(Property::Commit) {
        ctx.props_mut().insert(Property::Commit, DEFAULT_COMMIT)?;
    }
    if !ctx.props().contains(Property::Notify) {
        ctx.props_mut().insert(Property::Notify, "")?;
    }

    service.signal(analysis::register_analysis(), ctx).await?;
    let analysis_id = ctx.require_text(Property::AnalysisId)?;

    if !ctx.props().contains(Property::RepoPath) {
        ctx.props_mut().insert(
            Property::RepoPath,
            format!("{}/{}/repo", WORKSPACE_MOUNT, analysis_id),
        )?;
    }

    info!("Analysis {} of {} launched", analysis_id, repo);

    let seed = ctx.props().seed(&BOOTSTRAP_SEED);
    let bootstrap = ctx
        .trigger(StageKind::Bootstrap.scheduler(), seed, true, false)
        .await?;
    let outcome = bootstrap.wait().await?;

    let dependencies = outcome
        .properties
        .get(Property::Dependencies)
        .map(PropertyValue::to_json)
        .unwrap_or_else(|| JsonValue::Array(Vec::new()));
    ctx.props_mut()
        .insert(Property::AnalysisStatus, analysis_status(outcome.status))?;
    ctx.props_mut().insert(Property::Dependencies, dependencies)?;
    service.signal(analysis::analysis_finished(), ctx).await?;

    if !outcome.succeeded() {
        warn!("Analysis {} ended {}", analysis_id, outcome.status);
        return Err(EngineError::ChildBuildFailure {
            failed: 1,
            total: 1,
        }
        .into());
    }

    info!("Analysis {} finished", analysis_id);
    Ok(())
}

/// Status reported to the backend for a terminal bootstrap
fn analysis_status(status: BuildStatus) -> &'static str {
    match status {
        BuildStatus::Succeeded => "SUCCEEDED",
        BuildStatus::Cancelled => "CANCELLED",
        _ => "FAILED",
    }
}
