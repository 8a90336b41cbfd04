//! Worker domain model
//!
//! Represents one container-backed execution slot of the worker pool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a pool slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    /// No container is running for this slot
    Idle,

    /// A container is being pulled or started
    Provisioning,

    /// A container is running and waiting for work
    Ready,

    /// A build holds this slot
    Busy,

    /// The container is being torn down
    Draining,

    /// Containers kept failing to start here; the slot takes no more work
    Gone,
}

impl WorkerState {
    /// Whether a new acquisition may bind this slot
    pub fn is_available(&self) -> bool {
        matches!(self, WorkerState::Idle | WorkerState::Ready)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Idle => write!(f, "Idle"),
            WorkerState::Provisioning => write!(f, "Provisioning"),
            WorkerState::Ready => write!(f, "Ready"),
            WorkerState::Busy => write!(f, "Busy"),
            WorkerState::Draining => write!(f, "Draining"),
            WorkerState::Gone => write!(f, "Gone"),
        }
    }
}

/// When images are pulled before a container starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PullPolicy {
    Always,
    IfNotPresent,
    Never,
}

impl PullPolicy {
    pub fn from_autopull(autopull: bool) -> Self {
        if autopull {
            PullPolicy::IfNotPresent
        } else {
            PullPolicy::Never
        }
    }
}

/// A provisioned execution agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    /// Slot name, stable for the lifetime of the pool
    pub name: String,

    /// Image the running container was started from
    pub image: Option<String>,

    /// Runtime identifier of the running container
    pub container_id: Option<String>,

    pub pull_policy: PullPolicy,

    pub state: WorkerState,

    /// Last time a build released this slot
    pub idle_since: Option<DateTime<Utc>>,

    /// Distinct images whose container failed to start here since the last
    /// successful start
    #[serde(default)]
    pub failed_images: Vec<String>,
}

impl Worker {
    pub fn new(name: impl Into<String>, pull_policy: PullPolicy) -> Self {
        Self {
            name: name.into(),
            image: None,
            container_id: None,
            pull_policy,
            state: WorkerState::Idle,
            idle_since: None,
            failed_images: Vec::new(),
        }
    }

    /// Whether the running container was started from `image`
    pub fn runs(&self, image: &str) -> bool {
        self.state == WorkerState::Ready && self.image.as_deref() == Some(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_worker_is_idle() {
        let worker = Worker::new("worker-0", PullPolicy::IfNotPresent);
        assert_eq!(worker.state, WorkerState::Idle);
        assert!(worker.state.is_available());
        assert!(!worker.runs("alpine"));
    }

    #[test]
    fn test_availability() {
        assert!(WorkerState::Ready.is_available());
        assert!(!WorkerState::Busy.is_available());
        assert!(!WorkerState::Provisioning.is_available());
        assert!(!WorkerState::Gone.is_available());
    }

    #[test]
    fn test_pull_policy_from_autopull() {
        assert_eq!(PullPolicy::from_autopull(true), PullPolicy::IfNotPresent);
        assert_eq!(PullPolicy::from_autopull(false), PullPolicy::Never);
    }
}
