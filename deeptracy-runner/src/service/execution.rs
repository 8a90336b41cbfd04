//! Execution service
//!
//! Runs the stage of a build. Each stage variant is a fixed sequence of
//! steps:
//! - launch: register the analysis, trigger bootstrap and wait for it
//! - bootstrap: check out the repository, expand manifests, fan out analyses
//! - analyze: run one task in its image and report what it found

use async_trait::async_trait;
use deeptracy_client::{BackendClient, SignalEvent, SignalResult};
use deeptracy_core::domain::build::StageKind;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::error::StageError;
use super::{analyze, bootstrap, launch};
use crate::expander::AllowList;
use crate::scheduler::StageContext;
use crate::secrets::SecretsProvider;

/// Service trait for running pipeline stages
#[async_trait]
pub trait ExecutionService: Send + Sync {
    /// Runs `stage` against the build behind `ctx`
    ///
    /// Properties the stage sets on `ctx` become the build's terminal
    /// properties, whether it succeeds or not.
    async fn execute(&self, stage: StageKind, ctx: &mut StageContext) -> Result<(), StageError>;
}

/// What the stages need to know about their environment
#[derive(Debug, Clone)]
pub struct StageSettings {
    /// Image bootstrap checks repositories out with
    pub checkout_image: String,

    /// Command run inside task images
    pub task_command: String,

    pub allow_list: AllowList,

    /// Operator-wide manifest expanded before the repository's own
    pub default_manifest: Option<PathBuf>,
}

/// Standard implementation of ExecutionService
pub struct StandardExecutionService {
    pub(super) client: BackendClient,
    pub(super) settings: StageSettings,
    pub(super) secrets: Arc<dyn SecretsProvider>,
}

impl StandardExecutionService {
    pub fn new(
        client: BackendClient,
        settings: StageSettings,
        secrets: Arc<dyn SecretsProvider>,
    ) -> Self {
        Self {
            client,
            settings,
            secrets,
        }
    }

    /// Sends a signal rendered against the build's properties
    ///
    /// Delivery failures only fail the stage when the signal is required.
    pub(super) async fn signal(
        &self,
        event: SignalEvent,
        ctx: &mut StageContext,
    ) -> Result<(), StageError> {
        let build_id = ctx.build_id();

        match self.client.send(&event, ctx.props_mut()).await {
            Ok(SignalResult::Skipped) => {
                debug!("Build {} skipped signal '{}'", build_id, event.name);
                Ok(())
            }
            Ok(SignalResult::Delivered { status }) => {
                debug!(
                    "Build {} delivered signal '{}' ({})",
                    build_id, event.name, status
                );
                Ok(())
            }
            Err(source) if event.required => Err(StageError::Signal {
                name: event.name,
                source,
            }),
            Err(e) => {
                warn!(
                    "Build {} failed to deliver signal '{}': {}",
                    build_id, event.name, e
                );
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ExecutionService for StandardExecutionService {
    async fn execute(&self, stage: StageKind, ctx: &mut StageContext) -> Result<(), StageError> {
        info!("Executing {} stage of build {}", stage, ctx.build_id());

        match stage {
            StageKind::Launch => launch::run(self, ctx).await,
            StageKind::Bootstrap => bootstrap::run(self, ctx).await,
            StageKind::Analyze => analyze::run(self, ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{PoolSettings, WorkerPool};
    use crate::runtime::fake::FakeRuntime;
    use crate::runtime::{ExecOutput, ExecRequest};
    use crate::scheduler::{BuildEngine, BuildOutcome, EngineSettings};
    use crate::secrets::NoSecrets;
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{Method, Uri};
    use axum::{Json, Router};
    use deeptracy_core::domain::build::BuildStatus;
    use deeptracy_core::domain::property::{Property, PropertySet, PropertyValue};
    use deeptracy_core::domain::worker::{PullPolicy, WorkerState};
    use serde_json::{Value as JsonValue, json};
    use std::sync::Mutex;
    use std::time::Duration;

    const CHECKOUT_IMAGE: &str = "alpine/git";
    const TASK_COMMAND: &str = "deeptracy-task";

    type Calls = Arc<Mutex<Vec<(String, String, JsonValue)>>>;

    async fn record(
        State(calls): State<Calls>,
        method: Method,
        uri: Uri,
        body: Bytes,
    ) -> Json<JsonValue> {
        let body = serde_json::from_slice(&body).unwrap_or(JsonValue::Null);
        calls
            .lock()
            .unwrap()
            .push((method.to_string(), uri.path().to_string(), body));
        Json(json!({"id": "a-1"}))
    }

    async fn spawn_backend() -> (String, Calls) {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new().fallback(record).with_state(calls.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{}", addr), calls)
    }

    /// Fakes git, the repository manifest and task containers
    ///
    /// Repositories named `broken` fail to clone; the image
    /// `deeptracy/fail` exits non-zero.
    fn runtime(manifest: &'static str) -> FakeRuntime {
        FakeRuntime::with_handler(move |image, request: &ExecRequest| {
            let ok = |stdout: &str| ExecOutput {
                stdout: stdout.to_string(),
                ..ExecOutput::default()
            };

            match request.program() {
                "git" if request.argv.iter().any(|a| a.contains("broken")) => ExecOutput {
                    exit_code: 128,
                    stderr: "repository not found".to_string(),
                    ..ExecOutput::default()
                },
                "cat" if manifest.is_empty() => ExecOutput {
                    exit_code: 1,
                    stderr: "No such file or directory".to_string(),
                    ..ExecOutput::default()
                },
                "cat" => ok(manifest),
                TASK_COMMAND if image == "deeptracy/fail" => ExecOutput {
                    exit_code: 1,
                    stderr: "scanner crashed".to_string(),
                    ..ExecOutput::default()
                },
                TASK_COMMAND => ok(r#"{"dependencies": [{"name": "serde"}]}"#),
                _ => ok(""),
            }
        })
    }

    struct Harness {
        engine: BuildEngine,
        runtime: Arc<FakeRuntime>,
        calls: Calls,
    }

    async fn harness(manifest: &'static str) -> Harness {
        harness_with(runtime(manifest), 2).await
    }

    async fn harness_with(runtime: FakeRuntime, size: usize) -> Harness {
        let (url, calls) = spawn_backend().await;
        let runtime = Arc::new(runtime);

        let pool = WorkerPool::new(
            runtime.clone(),
            PoolSettings {
                size,
                pull_policy: PullPolicy::IfNotPresent,
                acquire_timeout: Duration::from_secs(5),
                idle_timeout: Duration::from_secs(60),
            },
        );
        let service = StandardExecutionService::new(
            BackendClient::new(url),
            StageSettings {
                checkout_image: CHECKOUT_IMAGE.to_string(),
                task_command: TASK_COMMAND.to_string(),
                allow_list: AllowList::new(["deeptracy/*"]).unwrap(),
                default_manifest: None,
            },
            Arc::new(NoSecrets),
        );
        let engine = BuildEngine::new(
            Arc::new(pool),
            Arc::new(service),
            EngineSettings {
                provision_retries: 3,
                retry_delay: Duration::from_millis(10),
            },
        );

        Harness {
            engine,
            runtime,
            calls,
        }
    }

    impl Harness {
        async fn launch(&self, repo: &str) -> BuildOutcome {
            let props = PropertySet::new()
                .with(Property::Repo, repo)
                .unwrap()
                .with(Property::Commit, "HEAD")
                .unwrap();
            self.engine.launch(props).unwrap().wait().await.unwrap()
        }

        fn paths(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(method, path, _)| format!("{} {}", method, path))
                .collect()
        }

        fn body(&self, path: &str) -> Option<JsonValue> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .find(|(_, p, _)| p == path)
                .map(|(_, _, body)| body.clone())
        }

        fn bootstrap(&self, launch: &BuildOutcome) -> deeptracy_core::domain::build::Build {
            let launch = self.engine.build(launch.id).unwrap();
            self.engine.build(launch.children[0]).unwrap()
        }
    }

    #[tokio::test]
    async fn test_zero_tasks_report_success() {
        let h = harness("projects: {}\n").await;

        let outcome = h.launch("https://example.com/app.git").await;

        assert_eq!(outcome.status, BuildStatus::Succeeded);
        assert_eq!(
            h.paths(),
            vec![
                "POST /analysis/",
                "PUT /analysis/a-1/extraction/started",
                "PUT /analysis/a-1/extraction/succeeded",
                "POST /analysis/a-1",
            ]
        );
        assert_eq!(
            h.body("/analysis/a-1/extraction/succeeded"),
            Some(json!({"task_count": 0}))
        );
        assert_eq!(
            h.body("/analysis/a-1"),
            Some(json!({"status": "SUCCEEDED", "dependencies": []}))
        );
    }

    #[tokio::test]
    async fn test_registration_seeds_bootstrap() {
        let h = harness("").await;

        let outcome = h.launch("https://example.com/app.git").await;

        assert_eq!(outcome.properties.analysis_id(), Some("a-1"));
        assert_eq!(
            h.body("/analysis/"),
            Some(json!({"repo": "https://example.com/app.git", "commit": "HEAD", "notify": ""}))
        );

        let bootstrap = h.bootstrap(&outcome);
        assert_eq!(bootstrap.properties.analysis_id(), Some("a-1"));
        assert_eq!(bootstrap.properties.repo_path(), Some("/workspace/a-1/repo"));
        // A missing repository manifest is not fatal
        assert_eq!(bootstrap.status, BuildStatus::Succeeded);
        assert_eq!(bootstrap.properties.task_count(), Some(0));
    }

    #[tokio::test]
    async fn test_known_analysis_is_not_registered_again() {
        let h = harness("").await;
        let props = PropertySet::new()
            .with(Property::Repo, "https://example.com/app.git")
            .unwrap()
            .with(Property::AnalysisId, "a-7")
            .unwrap();

        let outcome = h.engine.launch(props).unwrap().wait().await.unwrap();

        assert_eq!(outcome.status, BuildStatus::Succeeded);
        assert!(!h.paths().contains(&"POST /analysis/".to_string()));
        assert!(
            h.paths()
                .contains(&"PUT /analysis/a-7/extraction/started".to_string())
        );
    }

    #[tokio::test]
    async fn test_pipeline_runs_every_task() {
        let h = harness(
            "projects:\n  web:\n    type: deeptracy/npm\n  core:\n    type: deeptracy/maven\n    strategy: full\n  docs:\n    type: deeptracy/docs-api\n  other:\n    type: evil/scanner\n",
        )
        .await;

        let outcome = h.launch("https://example.com/app.git").await;

        assert_eq!(outcome.status, BuildStatus::Succeeded);
        assert_eq!(
            h.body("/analysis/a-1/extraction/succeeded"),
            Some(json!({"task_count": 2}))
        );

        let bootstrap = h.bootstrap(&outcome);
        assert_eq!(bootstrap.children.len(), 2);
        assert_eq!(
            bootstrap.properties.get(Property::DependencyReports),
            Some(&PropertyValue::Integer(2))
        );
        assert_eq!(
            bootstrap.properties.get(Property::VulnerabilityReports),
            Some(&PropertyValue::Integer(0))
        );
        assert_eq!(
            h.body("/analysis/a-1"),
            Some(json!({
                "status": "SUCCEEDED",
                "dependencies": [{"name": "serde"}, {"name": "serde"}],
            }))
        );

        for child in &bootstrap.children {
            let analyze = h.engine.build(*child).unwrap();
            let execution = analyze.properties.lookup("execution_id").unwrap();
            assert_eq!(execution, json!(child.to_string()));
            let path = format!("/analysis/a-1/{}/dependencies", child);
            assert_eq!(h.body(&path), Some(json!([{"name": "serde"}])));
        }

        let tasks: Vec<_> = h
            .runtime
            .execs()
            .into_iter()
            .filter(|(_, argv)| argv[0] == TASK_COMMAND)
            .collect();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.contains(&(
            "deeptracy/maven".to_string(),
            vec![TASK_COMMAND.to_string(), "full".to_string()]
        )));
        assert!(tasks.contains(&(
            "deeptracy/npm".to_string(),
            vec![TASK_COMMAND.to_string(), "main".to_string()]
        )));
        assert!(!h.paths().iter().any(|p| p.ends_with("/vulnerabilities")));
    }

    #[tokio::test]
    async fn test_checkout_failure_reports_extraction_failed() {
        let h = harness("projects:\n  web:\n    type: deeptracy/npm\n").await;

        let outcome = h.launch("https://example.com/broken.git").await;

        assert_eq!(outcome.status, BuildStatus::Failed);
        let bootstrap = h.bootstrap(&outcome);
        assert_eq!(bootstrap.status, BuildStatus::Failed);
        assert!(bootstrap.children.is_empty());
        assert!(
            bootstrap
                .error_message
                .unwrap()
                .contains("repository not found")
        );
        assert_eq!(
            h.paths()[1..],
            [
                "PUT /analysis/a-1/extraction/started".to_string(),
                "PUT /analysis/a-1/extraction/failed".to_string(),
                "POST /analysis/a-1".to_string(),
            ]
        );
        assert_eq!(
            h.body("/analysis/a-1"),
            Some(json!({"status": "FAILED", "dependencies": []}))
        );
    }

    #[tokio::test]
    async fn test_checkout_keeps_user_input_out_of_options() {
        let h = harness("").await;

        h.launch("https://example.com/app.git").await;

        let git: Vec<_> = h
            .runtime
            .execs()
            .into_iter()
            .filter(|(_, argv)| argv[0] == "git")
            .map(|(_, argv)| argv)
            .collect();
        assert_eq!(
            git,
            vec![
                vec![
                    "git",
                    "clone",
                    "--quiet",
                    "--",
                    "https://example.com/app.git",
                    "/workspace/a-1/repo",
                ],
                vec!["git", "-C", "/workspace/a-1/repo", "checkout", "--quiet", "HEAD", "--"],
            ]
        );
    }

    #[tokio::test]
    async fn test_unimportant_task_failure_is_tolerated() {
        let h = harness(
            "projects:\n  web:\n    type: deeptracy/npm\n  flaky:\n    type: deeptracy/fail\n    unimportant: true\n",
        )
        .await;

        let outcome = h.launch("https://example.com/app.git").await;

        assert_eq!(outcome.status, BuildStatus::Succeeded);
        let bootstrap = h.bootstrap(&outcome);
        let statuses: Vec<_> = bootstrap
            .children
            .iter()
            .map(|c| h.engine.build(*c).unwrap().status)
            .collect();
        assert!(statuses.contains(&BuildStatus::Failed));
        assert!(statuses.contains(&BuildStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_required_task_failure_fails_pipeline() {
        let h = harness(
            "projects:\n  web:\n    type: deeptracy/npm\n  core:\n    type: deeptracy/fail\n",
        )
        .await;

        let outcome = h.launch("https://example.com/app.git").await;

        assert_eq!(outcome.status, BuildStatus::Failed);
        let bootstrap = h.bootstrap(&outcome);
        assert_eq!(bootstrap.status, BuildStatus::Failed);
        // The healthy sibling still ran to completion and reported
        assert_eq!(
            bootstrap.properties.get(Property::DependencyReports),
            Some(&PropertyValue::Integer(1))
        );
        // Extraction itself succeeded
        assert!(
            h.paths()
                .contains(&"PUT /analysis/a-1/extraction/succeeded".to_string())
        );
        // The analysis is still closed, with what the healthy task found
        assert_eq!(
            h.body("/analysis/a-1"),
            Some(json!({"status": "FAILED", "dependencies": [{"name": "serde"}]}))
        );
    }

    #[tokio::test]
    async fn test_unstartable_unimportant_image_spares_siblings() {
        let manifest = "projects:\n  aaa:\n    type: deeptracy/typo\n    unimportant: true\n  web:\n    type: deeptracy/npm\n  zzz:\n    type: deeptracy/pip\n";
        let h = harness_with(runtime(manifest).broken("deeptracy/typo"), 1).await;

        let outcome = h.launch("https://example.com/app.git").await;

        assert_eq!(outcome.status, BuildStatus::Succeeded);
        let bootstrap = h.bootstrap(&outcome);
        let statuses: Vec<_> = bootstrap
            .children
            .iter()
            .map(|c| {
                let child = h.engine.build(*c).unwrap();
                (child.properties.project().unwrap().to_string(), child.status)
            })
            .collect();
        assert!(statuses.contains(&("aaa".to_string(), BuildStatus::Failed)));
        assert!(statuses.contains(&("web".to_string(), BuildStatus::Succeeded)));
        assert!(statuses.contains(&("zzz".to_string(), BuildStatus::Succeeded)));

        assert!(
            h.engine
                .pool()
                .snapshot()
                .iter()
                .all(|w| w.state != WorkerState::Gone)
        );
    }
}
