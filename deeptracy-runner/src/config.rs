//! Runner configuration
//!
//! Defines all configurable parameters for the runner: pool sizing and
//! timeouts, the image allow-list, the container runtime endpoint and the
//! backend connection.

use anyhow::Context;
use std::path::PathBuf;
use std::time::Duration;

use crate::expander::AllowList;

/// Runner configuration
///
/// Loaded once at start and immutable afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of worker slots in the pool
    pub worker_count: usize,

    /// Glob patterns task images must match
    pub allowed_images: Vec<String>,

    /// Pull images that are not present locally
    pub autopull: bool,

    /// Remote podman service (e.g., "unix:///run/podman/podman.sock")
    pub container_url: Option<String>,

    /// Backend base URL (e.g., "http://localhost:8088")
    pub backend_url: String,

    /// Directory holding named secret files
    pub secrets_dir: Option<PathBuf>,

    /// Operator-wide manifest expanded for every repository
    pub default_manifest: Option<PathBuf>,

    /// Host directory mounted as the workspace of every container
    pub workspace: PathBuf,

    /// Image used to check repositories out
    pub checkout_image: String,

    /// Command run inside task images
    pub task_command: String,

    /// Maximum time a build waits for a worker (zero: fail at once when busy)
    pub acquire_timeout: Duration,

    /// Time after which an unused container is torn down
    pub idle_timeout: Duration,

    /// Re-queues of a worker acquisition after a provisioning failure
    pub provision_retries: u32,
}

impl Config {
    /// Creates configuration from environment variables
    ///
    /// Expected environment variables (all optional):
    /// - DEEPTRACY_WORKER_COUNT (default: 4)
    /// - DEEPTRACY_ALLOWED_IMAGES (comma-separated, default: deeptracy/*)
    /// - DEEPTRACY_AUTOPULL (default: true)
    /// - DEEPTRACY_CONTAINER_URL
    /// - DEEPTRACY_BACKEND_URL (default: http://localhost:8088)
    /// - DEEPTRACY_SECRETS_DIR
    /// - DEEPTRACY_DEFAULT_MANIFEST
    /// - DEEPTRACY_WORKSPACE (default: /tmp/deeptracy)
    /// - DEEPTRACY_CHECKOUT_IMAGE (default: docker.io/alpine/git:latest)
    /// - DEEPTRACY_TASK_COMMAND (default: deeptracy-task)
    /// - DEEPTRACY_ACQUIRE_TIMEOUT (seconds, default: 300, 0 never waits)
    /// - DEEPTRACY_IDLE_TIMEOUT (seconds, default: 600)
    /// - DEEPTRACY_PROVISION_RETRIES (default: 3)
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Creates configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();

        let seconds = |key: &str, default: Duration| -> anyhow::Result<Duration> {
            match lookup(key) {
                Some(value) => value
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .with_context(|| format!("{} must be a number of seconds", key)),
                None => Ok(default),
            }
        };

        let worker_count = match lookup("DEEPTRACY_WORKER_COUNT") {
            Some(value) => value
                .trim()
                .parse::<usize>()
                .context("DEEPTRACY_WORKER_COUNT must be a positive integer")?,
            None => defaults.worker_count,
        };

        let allowed_images = lookup("DEEPTRACY_ALLOWED_IMAGES")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or(defaults.allowed_images);

        let autopull = match lookup("DEEPTRACY_AUTOPULL") {
            Some(value) => parse_flag(&value)
                .with_context(|| format!("DEEPTRACY_AUTOPULL is not a boolean: {}", value))?,
            None => defaults.autopull,
        };

        let provision_retries = match lookup("DEEPTRACY_PROVISION_RETRIES") {
            Some(value) => value
                .trim()
                .parse::<u32>()
                .context("DEEPTRACY_PROVISION_RETRIES must be a non-negative integer")?,
            None => defaults.provision_retries,
        };

        Ok(Self {
            worker_count,
            allowed_images,
            autopull,
            container_url: lookup("DEEPTRACY_CONTAINER_URL").filter(|s| !s.is_empty()),
            backend_url: lookup("DEEPTRACY_BACKEND_URL").unwrap_or(defaults.backend_url),
            secrets_dir: lookup("DEEPTRACY_SECRETS_DIR")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            default_manifest: lookup("DEEPTRACY_DEFAULT_MANIFEST")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            workspace: lookup("DEEPTRACY_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace),
            checkout_image: lookup("DEEPTRACY_CHECKOUT_IMAGE").unwrap_or(defaults.checkout_image),
            task_command: lookup("DEEPTRACY_TASK_COMMAND").unwrap_or(defaults.task_command),
            acquire_timeout: seconds("DEEPTRACY_ACQUIRE_TIMEOUT", defaults.acquire_timeout)?,
            idle_timeout: seconds("DEEPTRACY_IDLE_TIMEOUT", defaults.idle_timeout)?,
            provision_retries,
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_count == 0 {
            anyhow::bail!("worker_count must be greater than 0");
        }

        if !self.backend_url.starts_with("http://") && !self.backend_url.starts_with("https://") {
            anyhow::bail!("backend_url must start with http:// or https://");
        }

        if self.allowed_images.is_empty() {
            anyhow::bail!("allowed_images cannot be empty");
        }
        self.allow_list()?;

        if self.checkout_image.is_empty() {
            anyhow::bail!("checkout_image cannot be empty");
        }

        if self.task_command.is_empty() {
            anyhow::bail!("task_command cannot be empty");
        }

        if self.idle_timeout.is_zero() {
            anyhow::bail!("idle_timeout must be greater than 0");
        }

        Ok(())
    }

    /// Compiled image allow-list
    pub fn allow_list(&self) -> anyhow::Result<AllowList> {
        AllowList::new(self.allowed_images.iter().cloned())
            .with_context(|| format!("invalid image pattern in {:?}", self.allowed_images))
    }

    /// How often the reaper looks for idle containers
    pub fn reap_interval(&self) -> Duration {
        (self.idle_timeout / 4).max(Duration::from_secs(1))
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: 4,
            allowed_images: vec!["deeptracy/*".to_string()],
            autopull: true,
            container_url: None,
            backend_url: "http://localhost:8088".to_string(),
            secrets_dir: None,
            default_manifest: None,
            workspace: PathBuf::from("/tmp/deeptracy"),
            checkout_image: "docker.io/alpine/git:latest".to_string(),
            task_command: "deeptracy-task".to_string(),
            acquire_timeout: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(600),
            provision_retries: 3,
        }
    }
}
