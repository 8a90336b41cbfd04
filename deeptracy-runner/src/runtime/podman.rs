//! Podman container runtime
//!
//! Drives the `podman` CLI:
//! - Checking podman availability
//! - Pulling images on demand
//! - Starting idle containers with the workspace mounted
//! - Executing commands in running containers
//! - Removing containers when a slot is drained

use anyhow::Context;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, error, info};

use super::{ContainerRuntime, ExecOutput, ExecRequest, RuntimeError};

/// Mount point of the workspace base inside every container
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// Mount point of the secrets directory inside every container
pub const SECRETS_MOUNT: &str = "/secrets";

/// Checks if podman is installed and reachable
pub async fn check_podman_available(url: Option<&str>) -> anyhow::Result<()> {
    let mut command = Command::new("podman");
    if let Some(url) = url {
        command.arg("--url").arg(url);
    }
    let output = command
        .arg("--version")
        .output()
        .await
        .context("Failed to execute 'podman --version'. Is podman installed?")?;

    if !output.status.success() {
        anyhow::bail!("Podman is not working correctly");
    }

    let version = String::from_utf8_lossy(&output.stdout);
    info!("Podman is available: {}", version.trim());

    Ok(())
}

/// Podman-backed [`ContainerRuntime`]
#[derive(Debug, Clone)]
pub struct PodmanRuntime {
    /// Remote service endpoint (`podman --url`), local socket when None
    url: Option<String>,

    /// Host directory mounted at [`WORKSPACE_MOUNT`]
    workspace: PathBuf,

    /// Host directory mounted read-only at [`SECRETS_MOUNT`]
    secrets: Option<PathBuf>,
}

impl PodmanRuntime {
    pub fn new(url: Option<String>, workspace: PathBuf, secrets: Option<PathBuf>) -> Self {
        Self {
            url,
            workspace,
            secrets,
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new("podman");
        if let Some(url) = &self.url {
            command.arg("--url").arg(url);
        }
        command.kill_on_drop(true);
        command
    }

    async fn run(&self, mut command: Command, label: &str) -> Result<Output, RuntimeError> {
        command.output().await.map_err(|source| RuntimeError::Spawn {
            command: label.to_string(),
            source,
        })
    }

    fn check(label: &str, output: &Output) -> Result<(), RuntimeError> {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        // Always log stdout/stderr as debug
        if !stdout.trim().is_empty() {
            debug!("{} stdout: {}", label, stdout.trim());
        }
        if !stderr.trim().is_empty() {
            debug!("{} stderr: {}", label, stderr.trim());
        }

        if output.status.success() {
            return Ok(());
        }

        Err(RuntimeError::Command {
            command: label.to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            stderr: stderr.trim().to_string(),
        })
    }
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    async fn image_present(&self, image: &str) -> Result<bool, RuntimeError> {
        let mut command = self.command();
        command.arg("image").arg("exists").arg(image);

        let output = self.run(command, "podman image exists").await?;
        Ok(output.status.success())
    }

    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        info!("Pulling image {}", image);

        let mut command = self.command();
        command.arg("pull").arg("--quiet").arg(image);

        let output = self.run(command, "podman pull").await?;
        Self::check("podman pull", &output)
    }

    async fn start(&self, name: &str, image: &str) -> Result<String, RuntimeError> {
        std::fs::create_dir_all(&self.workspace).map_err(|source| RuntimeError::Spawn {
            command: "create workspace".to_string(),
            source,
        })?;

        info!("Creating container {} for image {}", name, image);

        // Keep the container idle so builds can exec into it.
        // The entrypoint is overridden for images with custom entrypoints (like alpine/git)
        let mut command = self.command();
        command
            .arg("run")
            .arg("-d")
            .arg("--replace")
            .arg("--name")
            .arg(name)
            .arg("--entrypoint")
            .arg("/bin/sh")
            .arg("-v")
            .arg(format!("{}:{}", self.workspace.display(), WORKSPACE_MOUNT));
        if let Some(secrets) = &self.secrets {
            command
                .arg("-v")
                .arg(format!("{}:{}:ro", secrets.display(), SECRETS_MOUNT));
        }
        command
            .arg("-w")
            .arg(WORKSPACE_MOUNT)
            .arg(image)
            .arg("-c")
            .arg("sleep infinity");

        let output = self.run(command, "podman run").await?;
        if let Err(e) = Self::check("podman run", &output) {
            error!("Failed to start container {} for image {}: {}", name, image, e);
            return Err(e);
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(
            "Container {} started successfully with ID: {}",
            name, container_id
        );

        Ok(container_id)
    }

    async fn exec(
        &self,
        container: &str,
        request: &ExecRequest,
    ) -> Result<ExecOutput, RuntimeError> {
        debug!("Executing in container {}: {:?}", container, request.argv);

        let working_dir = match request.cwd.as_deref() {
            Some(dir) if dir.starts_with('/') => dir.to_string(),
            Some(dir) => format!("{}/{}", WORKSPACE_MOUNT, dir),
            None => WORKSPACE_MOUNT.to_string(),
        };

        let mut command = self.command();
        command.arg("exec").arg("-w").arg(&working_dir);
        for (key, value) in &request.env {
            command.arg("-e").arg(format!("{}={}", key, value));
        }
        command.arg(container).args(&request.argv);

        let output = self.run(command, "podman exec").await?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(1);

        if exit_code != 0 {
            debug!(
                "Command failed in container {}: cmd={} exit_code={} stderr='{}'",
                container,
                request.program(),
                exit_code,
                stderr.trim()
            );
        } else {
            debug!(
                "Command completed successfully: stdout_len={}, stderr_len={}",
                stdout.len(),
                stderr.len()
            );
        }

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    async fn remove(&self, container: &str) -> Result<(), RuntimeError> {
        debug!("Removing container {}", container);

        let mut command = self.command();
        command.arg("rm").arg("-f").arg("-t").arg("5").arg(container);

        let output = self.run(command, "podman rm").await?;
        Self::check("podman rm", &output)
    }
}
