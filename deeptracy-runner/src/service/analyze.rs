//! Analyze stage
//!
//! Runs `<task command> <strategy>` inside the task image with the option
//! bag in `TASK_OPTIONS`. The task prints a JSON report on stdout.

use deeptracy_client::analysis;
use deeptracy_core::domain::property::Property;
use deeptracy_core::domain::task::DEFAULT_STRATEGY;
use deeptracy_core::dto::analysis::TaskReport;
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info};

use super::error::StageError;
use super::execution::StandardExecutionService;
use crate::runtime::ExecRequest;
use crate::scheduler::StageContext;

/// Environment variable carrying the task's option bag
pub const TASK_OPTIONS_ENV: &str = "TASK_OPTIONS";

pub(super) async fn run(
    service: &StandardExecutionService,
    ctx: &mut StageContext,
) -> Result<(), StageError> {
    let build_id = ctx.build_id();
    ctx.props_mut()
        .insert(Property::ExecutionId, build_id.to_string())?;

    let image = ctx.require_text(Property::TaskImage)?;
    let strategy = ctx
        .props()
        .task_strategy()
        .unwrap_or(DEFAULT_STRATEGY)
        .to_string();
    let options = ctx
        .props()
        .task_options()
        .cloned()
        .unwrap_or_else(|| JsonValue::Object(Map::new()));

    let worker = ctx.acquire_worker(&image).await?;
    info!(
        "Build {} running {} ({}) on {} ({})",
        build_id,
        ctx.props().project().unwrap_or("unnamed project"),
        strategy,
        worker.name(),
        worker.container_id()
    );

    let mut request = ExecRequest::new([service.settings.task_command.as_str(), strategy.as_str()])
        .env(TASK_OPTIONS_ENV, options.to_string());
    if let Some(path) = ctx.props().repo_path() {
        request = request.cwd(path);
    }

    let output = worker.exec(&request).await?;
    ctx.release_worker(worker);
    if !output.success() {
        return Err(StageError::Task {
            exit_code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        });
    }

    let report: TaskReport = if output.stdout.trim().is_empty() {
        debug!("Build {} task printed no report", build_id);
        TaskReport::default()
    } else {
        serde_json::from_str(output.stdout.trim())?
    };

    if let Some(dependencies) = report.dependencies {
        ctx.props_mut()
            .insert(Property::Dependencies, dependencies)?;
    }
    if let Some(vulnerabilities) = report.vulnerabilities {
        ctx.props_mut()
            .insert(Property::Vulnerabilities, vulnerabilities)?;
    }

    service.signal(analysis::dependencies_report(), ctx).await?;
    service.signal(analysis::vulnerabilities_report(), ctx).await?;
    Ok(())
}
