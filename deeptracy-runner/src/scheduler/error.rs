use deeptracy_core::domain::build::BuildId;
use deeptracy_core::domain::property::PropertyError;
use thiserror::Error;

/// Errors raised by the build graph engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no scheduler named '{0}'")]
    UnknownScheduler(String),

    #[error("build {0} not found")]
    UnknownBuild(BuildId),

    #[error("{failed} of {total} required child build(s) did not succeed")]
    ChildBuildFailure { failed: usize, total: usize },

    #[error("failed to seed child properties: {0}")]
    Property(#[from] PropertyError),
}
