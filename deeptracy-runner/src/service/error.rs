use deeptracy_client::ClientError;
use deeptracy_core::domain::property::{Property, PropertyError};
use thiserror::Error;

use crate::pool::PoolError;
use crate::runtime::RuntimeError;
use crate::scheduler::EngineError;

/// Reasons a pipeline stage fails
#[derive(Debug, Error)]
pub enum StageError {
    #[error("no worker available: {0}")]
    Worker(#[from] PoolError),

    #[error("container command failed: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("checkout of {repo} failed: {reason}")]
    Checkout { repo: String, reason: String },

    #[error("required signal '{name}' failed: {source}")]
    Signal {
        name: String,
        #[source]
        source: ClientError,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Property(#[from] PropertyError),

    #[error("property '{0}' is not set")]
    MissingProperty(Property),

    #[error("task exited with {exit_code}: {stderr}")]
    Task { exit_code: i32, stderr: String },

    #[error("task printed an invalid report: {0}")]
    Report(#[from] serde_json::Error),
}
