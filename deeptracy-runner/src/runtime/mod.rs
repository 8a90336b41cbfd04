//! Container runtime layer
//!
//! The worker pool talks to containers only through [`ContainerRuntime`],
//! so the scheduler can be exercised without a container engine.

pub mod podman;

#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use thiserror::Error;

pub use podman::PodmanRuntime;

/// A command to run inside a container
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Working directory inside the container (None = /workspace)
    pub cwd: Option<String>,
}

impl ExecRequest {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// First argument, used in log lines and errors
    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }
}

/// Captured result of an [`ExecRequest`]
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Errors raised by a container runtime
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' exited with {exit_code}: {stderr}")]
    Command {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("image {0} is not present and pulling is disabled")]
    ImageMissing(String),
}

/// Operations the worker pool needs from a container engine
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Whether `image` is available locally
    async fn image_present(&self, image: &str) -> Result<bool, RuntimeError>;

    async fn pull(&self, image: &str) -> Result<(), RuntimeError>;

    /// Starts a long-running container and returns its identifier
    async fn start(&self, name: &str, image: &str) -> Result<String, RuntimeError>;

    async fn exec(&self, container: &str, request: &ExecRequest)
    -> Result<ExecOutput, RuntimeError>;

    /// Stops and removes a container
    async fn remove(&self, container: &str) -> Result<(), RuntimeError>;
}
