//! Secrets provider
//!
//! Secrets are files in a host directory mounted read-only into every
//! worker container. Stages look them up by name and receive the path the
//! secret has inside the container.

use std::path::PathBuf;
use tracing::debug;

use crate::runtime::podman::SECRETS_MOUNT;

/// Name of the SSH private key used for repository checkout
pub const SSH_KEY: &str = "id_rsa";

/// Name of the SSH known hosts file used for repository checkout
pub const KNOWN_HOSTS: &str = "known_hosts";

pub trait SecretsProvider: Send + Sync {
    /// In-container path of the secret `name`, if it exists
    fn resolve(&self, name: &str) -> Option<String>;
}

/// Secrets stored as files under a directory
#[derive(Debug, Clone)]
pub struct FileSecrets {
    dir: PathBuf,
}

impl FileSecrets {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl SecretsProvider for FileSecrets {
    fn resolve(&self, name: &str) -> Option<String> {
        if name.is_empty() || name.contains('/') || name.starts_with('.') {
            debug!("Refusing secret name {:?}", name);
            return None;
        }

        if !self.dir.join(name).is_file() {
            debug!("Secret {} not found in {}", name, self.dir.display());
            return None;
        }

        Some(format!("{}/{}", SECRETS_MOUNT, name))
    }
}

/// Provider used when no secrets directory is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSecrets;

impl SecretsProvider for NoSecrets {
    fn resolve(&self, _name: &str) -> Option<String> {
        None
    }
}

/// SSH command line for git built from the available secrets
///
/// Returns None when no private key is available, leaving git's defaults.
pub fn git_ssh_command(secrets: &dyn SecretsProvider) -> Option<String> {
    let key = secrets.resolve(SSH_KEY)?;

    let hosts = match secrets.resolve(KNOWN_HOSTS) {
        Some(path) => format!("-o UserKnownHostsFile={}", path),
        None => "-o StrictHostKeyChecking=accept-new".to_string(),
    };

    Some(format!("ssh -i {} -o IdentitiesOnly=yes {}", key, hosts))
}
