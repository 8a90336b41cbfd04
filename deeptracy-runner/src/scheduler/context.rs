//! Stage context
//!
//! What a running stage sees of the engine: its own property set, worker
//! acquisition and child triggering. Children are triggered with `self` as
//! parent, so the build tree and cancellation follow automatically.

use deeptracy_core::domain::build::{BuildId, StageKind};
use deeptracy_core::domain::property::{Property, PropertyError, PropertySet, PropertyValue};
use deeptracy_core::domain::task::TaskSpec;
use std::time::Duration;
use tracing::{info, warn};

use super::engine::{BuildEngine, BuildRef, FanIn, reduce};
use super::error::EngineError;
use crate::pool::{PoolError, WorkerLease};
use crate::service::StageError;

/// Upper bound of the provisioning retry delay
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

pub struct StageContext {
    engine: BuildEngine,
    build_id: BuildId,
    stage: StageKind,
    properties: PropertySet,
}

impl StageContext {
    pub(crate) fn new(
        engine: BuildEngine,
        build_id: BuildId,
        stage: StageKind,
        properties: PropertySet,
    ) -> Self {
        Self {
            engine,
            build_id,
            stage,
            properties,
        }
    }

    pub fn build_id(&self) -> BuildId {
        self.build_id
    }

    pub fn props(&self) -> &PropertySet {
        &self.properties
    }

    pub fn props_mut(&mut self) -> &mut PropertySet {
        &mut self.properties
    }

    /// Value of a property the stage cannot run without
    pub fn require(&self, key: Property) -> Result<&PropertyValue, StageError> {
        self.properties
            .get(key)
            .ok_or(StageError::MissingProperty(key))
    }

    /// Text value of a required property
    pub fn require_text(&self, key: Property) -> Result<String, StageError> {
        Ok(self.require(key)?.to_text())
    }

    /// Acquires a worker running `image`, re-queueing on provisioning errors
    ///
    /// Retries back off exponentially, starting at the engine's retry delay.
    pub async fn acquire_worker(&self, image: &str) -> Result<WorkerLease, PoolError> {
        let settings = self.engine.settings();
        let mut attempt = 0;
        let mut delay = settings.retry_delay;

        loop {
            attempt += 1;

            match self.engine.pool().acquire(image).await {
                Ok(lease) => {
                    if attempt > 1 {
                        info!(
                            "Build {} acquired {} after {} attempt(s)",
                            self.build_id,
                            lease.name(),
                            attempt
                        );
                    }
                    return Ok(lease);
                }
                Err(e) if e.is_retryable() && attempt <= settings.provision_retries => {
                    warn!(
                        "Build {} ({}) could not get a worker for {} (attempt {}): {}. Retrying in {:?}",
                        self.build_id, self.stage, image, attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_RETRY_DELAY);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Hands a worker back to the pool
    pub fn release_worker(&self, lease: WorkerLease) {
        self.engine.pool().release(lease);
    }

    /// Triggers a child build, optionally waiting for it to finish
    pub async fn trigger(
        &mut self,
        scheduler: &str,
        properties: PropertySet,
        wait_for_finish: bool,
        unimportant: bool,
    ) -> Result<BuildRef, EngineError> {
        let child = self.engine.trigger(
            Some(self.build_id),
            scheduler,
            properties,
            wait_for_finish,
            unimportant,
        )?;

        if wait_for_finish {
            child.wait().await?;
        }
        Ok(child)
    }

    /// Fans out one child per task spec and waits for all of them
    ///
    /// Each child starts from a copy of the `seed` keys of this build,
    /// extended with the spec's own properties.
    pub async fn trigger_many<I>(
        &mut self,
        scheduler: &str,
        specs: I,
        seed: &[Property],
    ) -> Result<FanIn, EngineError>
    where
        I: IntoIterator<Item = TaskSpec>,
    {
        let mut batch = Vec::new();
        for spec in specs {
            let mut properties = self.properties.seed(seed);
            properties.merge(spec.properties()?)?;
            batch.push((properties, spec.unimportant));
        }

        self.engine
            .trigger_many(self.build_id, scheduler, batch)
            .await
    }

    /// Aggregates a fan-in into this build's properties
    pub fn reduce<F>(&mut self, fan_in: &FanIn, f: F) -> Result<(), EngineError>
    where
        F: FnOnce(&[&PropertySet]) -> Result<PropertySet, PropertyError>,
    {
        let aggregated = reduce(fan_in.outcomes(), f)?;
        self.properties.merge(aggregated)?;
        Ok(())
    }

    pub(crate) fn into_properties(self) -> PropertySet {
        self.properties
    }
}
