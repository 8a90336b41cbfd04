//! Build graph engine
//!
//! Builds form a tree rooted at a launch build. Every build runs in its own
//! tokio task; triggering a child never blocks on the worker pool, only the
//! child's own stage does when it acquires a worker.
//!
//! A build's status is published on a watch channel so waiters wake as soon
//! as it turns terminal. The final properties are written to the registry
//! before the terminal status is sent.

use chrono::Utc;
use deeptracy_core::domain::build::{Build, BuildId, BuildStatus, StageKind};
use deeptracy_core::domain::property::PropertySet;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::context::StageContext;
use super::error::EngineError;
use crate::pool::WorkerPool;
use crate::service::ExecutionService;

/// Retry policy for worker provisioning
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Re-queues after a retryable provisioning error
    pub provision_retries: u32,

    /// Delay before the first re-queue, doubled on every attempt
    pub retry_delay: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            provision_retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

struct BuildRecord {
    build: Build,
    status: watch::Sender<BuildStatus>,
    cancel: CancellationToken,
    /// Whether the parent waits for this build before turning terminal
    awaited: bool,
}

struct EngineInner {
    builds: Mutex<HashMap<BuildId, BuildRecord>>,
    pool: Arc<WorkerPool>,
    executor: Arc<dyn ExecutionService>,
    settings: EngineSettings,
}

/// Scheduler core: creates builds, runs their stages, tracks the tree
#[derive(Clone)]
pub struct BuildEngine {
    inner: Arc<EngineInner>,
}

impl BuildEngine {
    pub fn new(
        pool: Arc<WorkerPool>,
        executor: Arc<dyn ExecutionService>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                builds: Mutex::new(HashMap::new()),
                pool,
                executor,
                settings,
            }),
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.inner.pool
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    /// Starts a pipeline run with a root launch build
    pub fn launch(&self, properties: PropertySet) -> Result<BuildRef, EngineError> {
        self.trigger(
            None,
            StageKind::Launch.scheduler(),
            properties,
            false,
            false,
        )
    }

    /// Creates a build on `scheduler` and starts running it
    ///
    /// The build is a child of `parent` when given: it inherits the parent's
    /// cancellation and, when `awaited`, holds the parent back from turning
    /// terminal until it finishes.
    pub fn trigger(
        &self,
        parent: Option<BuildId>,
        scheduler: &str,
        properties: PropertySet,
        awaited: bool,
        unimportant: bool,
    ) -> Result<BuildRef, EngineError> {
        let stage = StageKind::from_scheduler(scheduler)
            .ok_or_else(|| EngineError::UnknownScheduler(scheduler.to_string()))?;

        let build = Build::new(stage, properties.clone(), parent, unimportant);
        let id = build.id;
        let (status_tx, status_rx) = watch::channel(BuildStatus::Pending);

        let cancel = {
            let mut builds = self.inner.builds.lock().unwrap();

            let cancel = match parent {
                Some(parent_id) => {
                    let parent = builds
                        .get_mut(&parent_id)
                        .ok_or(EngineError::UnknownBuild(parent_id))?;
                    parent.build.children.push(id);
                    parent.cancel.child_token()
                }
                None => CancellationToken::new(),
            };

            builds.insert(
                id,
                BuildRecord {
                    build,
                    status: status_tx,
                    cancel: cancel.clone(),
                    awaited,
                },
            );
            cancel
        };

        match parent {
            Some(parent_id) => info!(
                "Triggered {} build {} (parent {}, unimportant: {})",
                stage, id, parent_id, unimportant
            ),
            None => info!("Triggered {} build {}", stage, id),
        }

        let engine = self.clone();
        tokio::spawn(async move {
            let run = tokio::spawn(engine.clone().run_build(id, stage, properties, cancel));
            if let Err(e) = run.await {
                error!("Build {} task panicked: {}", id, e);
                engine.finish(id, BuildStatus::Failed, None, Some(format!("panicked: {}", e)));
            }
        });

        Ok(BuildRef {
            id,
            unimportant,
            status: status_rx,
            engine: self.clone(),
        })
    }

    /// Triggers one awaited child per property set, then waits for all
    ///
    /// Never short-circuits: every triggered child reaches a terminal state
    /// before this returns, whatever its siblings did.
    pub async fn trigger_many(
        &self,
        parent: BuildId,
        scheduler: &str,
        batch: Vec<(PropertySet, bool)>,
    ) -> Result<FanIn, EngineError> {
        let total = batch.len();
        let mut refs = Vec::with_capacity(total);
        let mut trigger_error = None;

        for (properties, unimportant) in batch {
            match self.trigger(Some(parent), scheduler, properties, true, unimportant) {
                Ok(child) => refs.push(child),
                Err(e) => {
                    trigger_error = Some(e);
                    break;
                }
            }
        }

        debug!(
            "Build {} waiting for {} {} build(s)",
            parent,
            refs.len(),
            scheduler
        );

        let mut outcomes = Vec::with_capacity(refs.len());
        for child in &refs {
            outcomes.push(child.wait().await?);
        }

        if let Some(e) = trigger_error {
            warn!(
                "Build {} triggered only {} of {} {} build(s): {}",
                parent,
                refs.len(),
                total,
                scheduler,
                e
            );
            return Err(e);
        }

        Ok(FanIn { outcomes })
    }

    /// Cancels a build and every Pending or Running descendant
    pub fn cancel(&self, id: BuildId) -> Result<(), EngineError> {
        let builds = self.inner.builds.lock().unwrap();
        let record = builds.get(&id).ok_or(EngineError::UnknownBuild(id))?;
        info!("Cancelling build {}", id);
        record.cancel.cancel();
        Ok(())
    }

    /// Snapshot of a build
    pub fn build(&self, id: BuildId) -> Option<Build> {
        let builds = self.inner.builds.lock().unwrap();
        builds.get(&id).map(|record| record.build.clone())
    }

    fn outcome(&self, id: BuildId) -> Result<BuildOutcome, EngineError> {
        let builds = self.inner.builds.lock().unwrap();
        let build = &builds.get(&id).ok_or(EngineError::UnknownBuild(id))?.build;
        Ok(BuildOutcome {
            id,
            stage: build.stage,
            status: build.status,
            unimportant: build.unimportant,
            properties: build.properties.clone(),
            error_message: build.error_message.clone(),
        })
    }

    async fn run_build(
        self,
        id: BuildId,
        stage: StageKind,
        properties: PropertySet,
        cancel: CancellationToken,
    ) {
        if cancel.is_cancelled() {
            info!("Build {} cancelled before it started", id);
            self.finish(id, BuildStatus::Cancelled, None, None);
            return;
        }

        self.start(id);
        info!("Build {} ({}) running", id, stage);

        let mut ctx = StageContext::new(self.clone(), id, stage, properties);
        let executor = Arc::clone(&self.inner.executor);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = executor.execute(stage, &mut ctx) => Some(result),
        };

        let (status, message) = match result {
            None => (BuildStatus::Cancelled, Some("cancelled".to_string())),
            Some(Ok(())) => (BuildStatus::Succeeded, None),
            Some(Err(e)) => (BuildStatus::Failed, Some(e.to_string())),
        };

        // A cancelled build waits for every descendant to wind down,
        // otherwise only for the children it awaited
        self.drain_children(id, status == BuildStatus::Cancelled).await;

        match &message {
            Some(reason) if status == BuildStatus::Failed => {
                warn!("Build {} ({}) failed: {}", id, stage, reason)
            }
            _ => info!("Build {} ({}) finished: {}", id, stage, status),
        }

        self.finish(id, status, Some(ctx.into_properties()), message);
    }

    fn start(&self, id: BuildId) {
        let mut builds = self.inner.builds.lock().unwrap();
        if let Some(record) = builds.get_mut(&id) {
            if record.build.status.can_transition_to(BuildStatus::Running) {
                record.build.status = BuildStatus::Running;
                record.build.started_at = Some(Utc::now());
                record.status.send_replace(BuildStatus::Running);
            }
        }
    }

    fn finish(
        &self,
        id: BuildId,
        status: BuildStatus,
        properties: Option<PropertySet>,
        message: Option<String>,
    ) {
        let mut builds = self.inner.builds.lock().unwrap();
        let Some(record) = builds.get_mut(&id) else {
            return;
        };
        if !record.build.status.can_transition_to(status) {
            debug!(
                "Build {} is already {}, ignoring {}",
                id, record.build.status, status
            );
            return;
        }

        if let Some(properties) = properties {
            record.build.properties = properties;
        }
        record.build.status = status;
        record.build.error_message = message;
        record.build.completed_at = Some(Utc::now());
        record.status.send_replace(status);
    }

    async fn drain_children(&self, id: BuildId, all: bool) {
        let pending: Vec<(BuildId, watch::Receiver<BuildStatus>)> = {
            let builds = self.inner.builds.lock().unwrap();
            let Some(record) = builds.get(&id) else {
                return;
            };
            record
                .build
                .children
                .iter()
                .filter_map(|child| builds.get(child).map(|r| (*child, r)))
                .filter(|(_, r)| all || r.awaited)
                .map(|(child, r)| (child, r.status.subscribe()))
                .collect()
        };

        for (child, mut status) in pending {
            if status.wait_for(BuildStatus::is_terminal).await.is_err() {
                warn!("Lost track of child build {} of {}", child, id);
            }
        }
    }
}

/// Handle to a triggered build
#[derive(Clone)]
pub struct BuildRef {
    id: BuildId,
    unimportant: bool,
    status: watch::Receiver<BuildStatus>,
    engine: BuildEngine,
}

impl BuildRef {
    pub fn id(&self) -> BuildId {
        self.id
    }

    /// Current status, without waiting
    pub fn status(&self) -> BuildStatus {
        *self.status.borrow()
    }

    /// Suspends until the build is terminal and returns its outcome
    pub async fn wait(&self) -> Result<BuildOutcome, EngineError> {
        let mut status = self.status.clone();
        // The sender lives in the registry, so this only errs on teardown
        let _ = status.wait_for(BuildStatus::is_terminal).await;
        self.engine.outcome(self.id)
    }
}

impl std::fmt::Debug for BuildRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildRef")
            .field("id", &self.id)
            .field("unimportant", &self.unimportant)
            .field("status", &self.status())
            .finish()
    }
}

/// Terminal state of a build as seen by whoever waited for it
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub id: BuildId,
    pub stage: StageKind,
    pub status: BuildStatus,
    pub unimportant: bool,
    pub properties: PropertySet,
    pub error_message: Option<String>,
}

impl BuildOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == BuildStatus::Succeeded
    }

    /// Whether this outcome fails whoever awaited it
    pub fn fails_parent(&self) -> bool {
        !self.unimportant && !self.succeeded()
    }
}

/// Outcomes of one fan-out, all terminal
#[derive(Debug, Clone, Default)]
pub struct FanIn {
    outcomes: Vec<BuildOutcome>,
}

impl FanIn {
    pub fn outcomes(&self) -> &[BuildOutcome] {
        &self.outcomes
    }

    /// Children whose failure propagates to the parent
    pub fn required_failures(&self) -> impl Iterator<Item = &BuildOutcome> {
        self.outcomes.iter().filter(|o| o.fails_parent())
    }

    /// Fails when any required child did not succeed
    ///
    /// Unimportant failures are logged and otherwise ignored.
    pub fn check(&self) -> Result<(), EngineError> {
        for outcome in self.outcomes.iter().filter(|o| o.unimportant && !o.succeeded()) {
            info!(
                "Unimportant {} build {} ended {}: {}",
                outcome.stage,
                outcome.id,
                outcome.status,
                outcome.error_message.as_deref().unwrap_or("no error recorded")
            );
        }

        let failed = self.required_failures().count();
        if failed > 0 {
            return Err(EngineError::ChildBuildFailure {
                failed,
                total: self.outcomes.len(),
            });
        }
        Ok(())
    }
}

/// Aggregates the terminal properties of `children`
pub fn reduce<F, T>(children: &[BuildOutcome], f: F) -> T
where
    F: FnOnce(&[&PropertySet]) -> T,
{
    let properties: Vec<&PropertySet> = children.iter().map(|c| &c.properties).collect();
    f(&properties)
}
