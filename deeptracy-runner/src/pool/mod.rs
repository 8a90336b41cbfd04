//! Worker pool
//!
//! A fixed set of named slots, each backed by at most one container. A
//! semaphore holds one permit per slot that can take work, so callers queue
//! when every slot is bound and acquisition is mutually exclusive per slot.
//!
//! Slot lifecycle:
//! - Idle → Provisioning → Busy when a build binds a slot without a container
//! - Ready → Busy when the running container already uses the requested image
//! - Busy → Ready when the lease is dropped
//! - Busy → Draining → Idle when the lease is dropped while a command runs
//! - Ready → Draining → Idle when the reaper tears down an idle container
//! - Provisioning → Idle when the image cannot be pulled or started
//! - Provisioning → Gone once containers of several different images failed
//!   to start on the slot in a row

use chrono::{DateTime, Utc};
use deeptracy_core::domain::worker::{PullPolicy, Worker, WorkerState};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info, warn};

use crate::runtime::{ContainerRuntime, ExecOutput, ExecRequest, RuntimeError};

/// Distinct images failing to start on one slot before it is retired
const SLOT_FAILURE_LIMIT: usize = 3;

/// Errors raised while acquiring a worker
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no worker slot is free")]
    Busy,

    #[error("timed out after {0:?} waiting for a worker")]
    Timeout(Duration),

    #[error("failed to provision {worker} with image {image}: {source}")]
    Provision {
        worker: String,
        image: String,
        #[source]
        source: RuntimeError,
    },

    #[error("every worker slot is gone")]
    Exhausted,
}

impl PoolError {
    /// Whether re-queueing the acquisition may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            PoolError::Provision { source, .. } => {
                !matches!(source, RuntimeError::ImageMissing(_))
            }
            _ => false,
        }
    }
}

/// Tunables of a [`WorkerPool`]
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub size: usize,
    pub pull_policy: PullPolicy,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

type Slots = Arc<Mutex<Vec<Worker>>>;

/// Why a container could not be provisioned
enum ProvisionFault {
    /// Checking or pulling the image failed; any slot would fail alike
    Image(RuntimeError),
    /// The container did not start
    Start(RuntimeError),
}

/// Exclusive hold on one provisioned worker
///
/// Dropping the lease returns the slot to the pool with its container still
/// running, ready for the next build using the same image. A lease dropped
/// while a command is still running (its build was cancelled) tears the
/// container down instead, since the command may outlive the lease.
pub struct WorkerLease {
    slots: Slots,
    index: usize,
    name: String,
    image: String,
    container_id: String,
    runtime: Arc<dyn ContainerRuntime>,
    in_flight: AtomicUsize,
    permit: Option<OwnedSemaphorePermit>,
}

impl WorkerLease {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Runs a command in the leased container
    pub async fn exec(&self, request: &ExecRequest) -> Result<ExecOutput, RuntimeError> {
        // Stays raised if this future is dropped before the command returns
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let output = self.runtime.exec(&self.container_id, request).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        output
    }

    fn interrupted(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease")
            .field("name", &self.name)
            .field("image", &self.image)
            .field("container_id", &self.container_id)
            .finish_non_exhaustive()
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        let permit = self.permit.take();

        if !self.interrupted() {
            {
                let mut slots = self.slots.lock().unwrap();
                if let Some(slot) = slots.get_mut(self.index) {
                    slot.state = WorkerState::Ready;
                    slot.idle_since = Some(Utc::now());
                }
            }
            debug!("Worker {} released", self.name);
            drop(permit);
            return;
        }

        warn!(
            "Worker {} released mid-command, tearing down container {}",
            self.name, self.container_id
        );
        {
            let mut slots = self.slots.lock().unwrap();
            if let Some(slot) = slots.get_mut(self.index) {
                slot.state = WorkerState::Draining;
                slot.image = None;
                slot.idle_since = None;
            }
        }

        // The permit travels with the teardown so the slot stays reserved
        let slots = Arc::clone(&self.slots);
        let runtime = Arc::clone(&self.runtime);
        let container = self.container_id.clone();
        let index = self.index;
        let teardown = async move {
            if let Err(e) = runtime.remove(&container).await {
                warn!("Failed to remove container {}: {}", container, e);
            }
            {
                let mut slots = slots.lock().unwrap();
                if let Some(slot) = slots.get_mut(index) {
                    slot.state = WorkerState::Idle;
                    slot.container_id = None;
                }
            }
            drop(permit);
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(teardown);
            }
            Err(_) => {
                // No runtime left to remove it: the next binding of this
                // slot removes the container as stale
                let mut slots = self.slots.lock().unwrap();
                if let Some(slot) = slots.get_mut(self.index) {
                    slot.state = WorkerState::Idle;
                }
                drop(slots);
                drop(teardown);
            }
        }
    }
}

enum Binding {
    Reuse(WorkerLeaseParts),
    Provision {
        index: usize,
        name: String,
        stale: Option<String>,
    },
}

struct WorkerLeaseParts {
    index: usize,
    name: String,
    container_id: String,
}

/// Fixed-size pool of container-backed workers
pub struct WorkerPool {
    runtime: Arc<dyn ContainerRuntime>,
    slots: Slots,
    permits: Arc<Semaphore>,
    settings: PoolSettings,
}

impl WorkerPool {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: PoolSettings) -> Self {
        let slots = (0..settings.size)
            .map(|i| Worker::new(format!("worker-{}", i), settings.pull_policy))
            .collect();

        Self {
            runtime,
            slots: Arc::new(Mutex::new(slots)),
            permits: Arc::new(Semaphore::new(settings.size)),
            settings,
        }
    }

    /// Copy of every slot's current state
    pub fn snapshot(&self) -> Vec<Worker> {
        self.slots.lock().unwrap().clone()
    }

    /// Binds a worker running `image`, waiting for a free slot
    ///
    /// Fails with [`PoolError::Timeout`] when no slot frees up within the
    /// acquire timeout. A zero timeout never waits and fails with
    /// [`PoolError::Busy`] instead.
    pub async fn acquire(&self, image: &str) -> Result<WorkerLease, PoolError> {
        if self.settings.acquire_timeout.is_zero() {
            return self.try_acquire(image).await;
        }

        let permit = tokio::time::timeout(
            self.settings.acquire_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        .map_err(|_| PoolError::Timeout(self.settings.acquire_timeout))?
        .map_err(|_| PoolError::Exhausted)?;

        self.bind(image, permit).await
    }

    /// Binds a worker running `image` without waiting
    pub async fn try_acquire(&self, image: &str) -> Result<WorkerLease, PoolError> {
        let permit = Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::NoPermits => PoolError::Busy,
                TryAcquireError::Closed => PoolError::Exhausted,
            })?;

        self.bind(image, permit).await
    }

    /// Returns a worker to the pool
    pub fn release(&self, lease: WorkerLease) {
        drop(lease);
    }

    async fn bind(
        &self,
        image: &str,
        permit: OwnedSemaphorePermit,
    ) -> Result<WorkerLease, PoolError> {
        let binding = {
            let mut slots = self.slots.lock().unwrap();
            match choose_slot(&mut slots, image) {
                Some(binding) => binding,
                None => return Err(PoolError::Busy),
            }
        };

        let (index, name, stale) = match binding {
            Binding::Reuse(parts) => {
                debug!("Reusing {} ({}) for image {}", parts.name, parts.container_id, image);
                return Ok(self.lease(parts, image, permit));
            }
            Binding::Provision { index, name, stale } => (index, name, stale),
        };

        if let Some(old) = stale {
            debug!("Replacing container {} on {}", old, name);
            if let Err(e) = self.runtime.remove(&old).await {
                warn!("Failed to remove container {}: {}", old, e);
            }
        }

        match self.provision(&name, image).await {
            Ok(container_id) => {
                {
                    let mut slots = self.slots.lock().unwrap();
                    let slot = &mut slots[index];
                    slot.state = WorkerState::Busy;
                    slot.image = Some(image.to_string());
                    slot.container_id = Some(container_id.clone());
                    slot.idle_since = None;
                    slot.failed_images.clear();
                }
                info!("Provisioned {} with image {}", name, image);
                Ok(self.lease(
                    WorkerLeaseParts {
                        index,
                        name,
                        container_id,
                    },
                    image,
                    permit,
                ))
            }
            Err(fault) => {
                let (source, retired, exhausted) = {
                    let mut slots = self.slots.lock().unwrap();
                    let slot = &mut slots[index];
                    slot.image = None;
                    slot.container_id = None;

                    let source = match fault {
                        ProvisionFault::Image(source) => source,
                        ProvisionFault::Start(source) => {
                            if !slot.failed_images.iter().any(|i| i == image) {
                                slot.failed_images.push(image.to_string());
                            }
                            source
                        }
                    };

                    let retired = slot.failed_images.len() >= SLOT_FAILURE_LIMIT;
                    slot.state = if retired {
                        WorkerState::Gone
                    } else {
                        WorkerState::Idle
                    };
                    let exhausted = slots.iter().all(|w| w.state == WorkerState::Gone);
                    (source, retired, exhausted)
                };

                if retired {
                    // The slot takes no more work: its permit leaves the pool
                    permit.forget();
                    if exhausted {
                        self.permits.close();
                    }
                    warn!(
                        "Worker {} retired after {} different images failed to start: {}",
                        name, SLOT_FAILURE_LIMIT, source
                    );
                } else {
                    drop(permit);
                    warn!("Worker {} could not provision {}: {}", name, image, source);
                }

                Err(PoolError::Provision {
                    worker: name,
                    image: image.to_string(),
                    source,
                })
            }
        }
    }

    async fn provision(&self, name: &str, image: &str) -> Result<String, ProvisionFault> {
        let pull = match self.settings.pull_policy {
            PullPolicy::Always => true,
            PullPolicy::IfNotPresent => !self
                .runtime
                .image_present(image)
                .await
                .map_err(ProvisionFault::Image)?,
            PullPolicy::Never => {
                let present = self
                    .runtime
                    .image_present(image)
                    .await
                    .map_err(ProvisionFault::Image)?;
                if !present {
                    return Err(ProvisionFault::Image(RuntimeError::ImageMissing(
                        image.to_string(),
                    )));
                }
                false
            }
        };
        if pull {
            self.runtime.pull(image).await.map_err(ProvisionFault::Image)?;
        }

        self.runtime
            .start(&container_name(name, image), image)
            .await
            .map_err(ProvisionFault::Start)
    }

    fn lease(
        &self,
        parts: WorkerLeaseParts,
        image: &str,
        permit: OwnedSemaphorePermit,
    ) -> WorkerLease {
        WorkerLease {
            slots: Arc::clone(&self.slots),
            index: parts.index,
            name: parts.name,
            image: image.to_string(),
            container_id: parts.container_id,
            runtime: Arc::clone(&self.runtime),
            in_flight: AtomicUsize::new(0),
            permit: Some(permit),
        }
    }

    /// Tears down containers idle longer than the idle timeout
    ///
    /// Returns how many containers were removed.
    pub async fn reap_idle(&self) -> usize {
        let now = Utc::now();
        let mut reaped = 0;

        for index in 0..self.settings.size {
            if !self.is_expired(index, now) {
                continue;
            }

            // Hold a permit while draining so no acquisition can pick the slot
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                break;
            };

            let target = {
                let mut slots = self.slots.lock().unwrap();
                let slot = &mut slots[index];
                if slot.state == WorkerState::Ready && expired(slot.idle_since, now, self.idle())
                {
                    slot.state = WorkerState::Draining;
                    slot.container_id.take().map(|id| (slot.name.clone(), id))
                } else {
                    None
                }
            };

            if let Some((name, container)) = target {
                info!("Tearing down idle container {} on {}", container, name);
                if let Err(e) = self.runtime.remove(&container).await {
                    warn!("Failed to remove container {}: {}", container, e);
                }
                let mut slots = self.slots.lock().unwrap();
                let slot = &mut slots[index];
                slot.state = WorkerState::Idle;
                slot.image = None;
                slot.idle_since = None;
                reaped += 1;
            }

            drop(permit);
        }

        reaped
    }

    /// Starts a background task reaping idle containers periodically
    pub fn spawn_reaper(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                ticker.tick().await;

                let reaped = self.reap_idle().await;
                if reaped > 0 {
                    debug!("Reaped {} idle container(s)", reaped);
                }
            }
        })
    }

    /// Stops and removes every container the pool started
    pub async fn shutdown(&self) {
        let containers: Vec<(String, String)> = {
            let mut slots = self.slots.lock().unwrap();
            slots
                .iter_mut()
                .filter_map(|slot| {
                    let id = slot.container_id.take()?;
                    slot.state = WorkerState::Idle;
                    slot.image = None;
                    Some((slot.name.clone(), id))
                })
                .collect()
        };

        info!("Cleaning up {} container(s)", containers.len());

        for (name, container) in containers {
            if let Err(e) = self.runtime.remove(&container).await {
                warn!("Failed to remove container {} of {}: {}", container, name, e);
            }
        }
    }

    fn idle(&self) -> Duration {
        self.settings.idle_timeout
    }

    fn is_expired(&self, index: usize, now: DateTime<Utc>) -> bool {
        let slots = self.slots.lock().unwrap();
        let slot = &slots[index];
        slot.state == WorkerState::Ready && expired(slot.idle_since, now, self.idle())
    }
}

fn expired(idle_since: Option<DateTime<Utc>>, now: DateTime<Utc>, idle: Duration) -> bool {
    match idle_since {
        Some(since) => (now - since).to_std().map(|d| d >= idle).unwrap_or(false),
        None => false,
    }
}

/// Picks and reserves the slot serving `image`
///
/// Prefers a container already running the image, then an empty slot, then
/// a container running another image.
fn choose_slot(slots: &mut [Worker], image: &str) -> Option<Binding> {
    if let Some(index) = slots.iter().position(|w| w.runs(image)) {
        let slot = &mut slots[index];
        slot.state = WorkerState::Busy;
        slot.idle_since = None;
        return Some(Binding::Reuse(WorkerLeaseParts {
            index,
            name: slot.name.clone(),
            container_id: slot.container_id.clone().unwrap_or_default(),
        }));
    }

    let index = slots
        .iter()
        .position(|w| w.state == WorkerState::Idle)
        .or_else(|| slots.iter().position(|w| w.state == WorkerState::Ready))?;

    let slot = &mut slots[index];
    slot.state = WorkerState::Provisioning;
    slot.idle_since = None;
    let stale = slot.container_id.take();
    slot.image = None;

    Some(Binding::Provision {
        index,
        name: slot.name.clone(),
        stale,
    })
}

/// Generates a container name for a slot and image
///
/// Uses a simple hash of the image name to keep naming stable
fn container_name(slot: &str, image: &str) -> String {
    let mut hasher = DefaultHasher::new();
    image.hash(&mut hasher);
    format!("deeptracy-{}-{:x}", slot, hasher.finish())
}
