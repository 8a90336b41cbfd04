//! Bootstrap stage
//!
//! Checks the repository out, expands the manifests into task specs and
//! fans out one analyze build per spec. The checkout worker is released
//! before the fan-out so the analyses can use every slot.

use deeptracy_client::analysis;
use deeptracy_core::domain::build::StageKind;
use deeptracy_core::domain::property::{Property, PropertySet, PropertyValue};
use deeptracy_core::domain::task::TaskSpec;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use super::error::StageError;
use super::execution::StandardExecutionService;
use crate::expander::{ExpandContext, ManifestSource, REPOSITORY_MANIFEST, expand_sources};
use crate::pool::WorkerLease;
use crate::runtime::ExecRequest;
use crate::scheduler::StageContext;
use crate::secrets::git_ssh_command;

/// Keys every analyze build inherits from bootstrap
const ANALYZE_SEED: [Property; 4] = [
    Property::Repo,
    Property::Commit,
    Property::AnalysisId,
    Property::RepoPath,
];

pub(super) async fn run(
    service: &StandardExecutionService,
    ctx: &mut StageContext,
) -> Result<(), StageError> {
    service.signal(analysis::extraction_started(), ctx).await?;

    let specs = match extract(service, ctx).await {
        Ok(specs) => specs,
        Err(e) => {
            warn!("Extraction of build {} failed: {}", ctx.build_id(), e);
            service.signal(analysis::extraction_failed(), ctx).await?;
            return Err(e);
        }
    };

    service.signal(analysis::extraction_succeeded(), ctx).await?;

    info!(
        "Build {} fanning out {} analysis task(s)",
        ctx.build_id(),
        specs.len()
    );

    let fan_in = ctx
        .trigger_many(StageKind::Analyze.scheduler(), specs, &ANALYZE_SEED)
        .await?;

    ctx.reduce(&fan_in, |children| {
        let count = |key: Property| children.iter().filter(|p| p.contains(key)).count() as i64;

        let dependencies: Vec<JsonValue> = children
            .iter()
            .filter_map(|p| match p.get(Property::Dependencies) {
                Some(PropertyValue::Document(JsonValue::Array(items))) => Some(items.clone()),
                Some(PropertyValue::Document(doc)) => Some(vec![doc.clone()]),
                _ => None,
            })
            .flatten()
            .collect();

        PropertySet::new()
            .with(Property::DependencyReports, count(Property::Dependencies))?
            .with(
                Property::VulnerabilityReports,
                count(Property::Vulnerabilities),
            )?
            .with(Property::Dependencies, JsonValue::Array(dependencies))
    })?;

    info!(
        "Build {} collected {} analysis result(s)",
        ctx.build_id(),
        fan_in.outcomes().len()
    );
    fan_in.check()?;
    Ok(())
}

/// Checks out the repository and expands its task specs
///
/// Sets `task_count` once the specs are known.
async fn extract(
    service: &StandardExecutionService,
    ctx: &mut StageContext,
) -> Result<Vec<TaskSpec>, StageError> {
    let repo = ctx.require_text(Property::Repo)?;
    let commit = ctx.require_text(Property::Commit)?;
    let repo_path = ctx.require_text(Property::RepoPath)?;

    let repository_manifest = {
        let worker = ctx
            .acquire_worker(&service.settings.checkout_image)
            .await?;
        checkout(service, &worker, &repo, &commit, &repo_path).await?;
        let manifest = read_repository_manifest(&worker, &repo_path).await;
        ctx.release_worker(worker);
        manifest
    };

    let mut sources = Vec::with_capacity(2);
    if let Some(path) = &service.settings.default_manifest {
        sources.push(ManifestSource::from_file(path).await);
    }
    sources.push(repository_manifest);

    let expand_ctx = ExpandContext {
        repo_path,
        allow_list: service.settings.allow_list.clone(),
    };
    let specs: Vec<TaskSpec> = expand_sources(sources, &expand_ctx).collect();

    ctx.props_mut()
        .insert(Property::TaskCount, specs.len() as i64)?;
    Ok(specs)
}

async fn checkout(
    service: &StandardExecutionService,
    worker: &WorkerLease,
    repo: &str,
    commit: &str,
    repo_path: &str,
) -> Result<(), StageError> {
    info!(
        "Checking out {} at {} on {} ({})",
        repo,
        commit,
        worker.name(),
        worker.image()
    );

    let ssh = git_ssh_command(service.secrets.as_ref());
    let steps = [
        vec!["rm", "-rf", repo_path],
        vec!["git", "clone", "--quiet", "--", repo, repo_path],
        vec!["git", "-C", repo_path, "checkout", "--quiet", commit, "--"],
    ];

    for argv in steps {
        let mut request = ExecRequest::new(argv);
        if let Some(ssh) = &ssh {
            request = request.env("GIT_SSH_COMMAND", ssh.as_str());
        }

        let output = worker.exec(&request).await?;
        if !output.success() {
            return Err(StageError::Checkout {
                repo: repo.to_string(),
                reason: format!(
                    "'{}' exited with {}: {}",
                    request.argv.join(" "),
                    output.exit_code,
                    output.stderr.trim()
                ),
            });
        }
    }

    Ok(())
}

async fn read_repository_manifest(worker: &WorkerLease, repo_path: &str) -> ManifestSource {
    let path = format!("{}/{}", repo_path, REPOSITORY_MANIFEST);

    match worker.exec(&ExecRequest::new(["cat", path.as_str()])).await {
        Ok(output) if output.success() => ManifestSource::new(path, output.stdout),
        Ok(output) => ManifestSource::unreadable(path, output.stderr.trim()),
        Err(e) => ManifestSource::unreadable(path, e),
    }
}
