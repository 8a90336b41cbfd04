//! Project manifest documents
//!
//! ```yaml
//! projects:
//!   backend:
//!     type: deeptracy/scan-maven
//!     strategy: full
//!     unimportant: true
//!     config:
//!       profile: release
//! ```

use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Errors raised while loading one manifest source
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest {origin} could not be read: {reason}")]
    Unreadable { origin: String, reason: String },

    #[error("manifest {origin} is malformed: {reason}")]
    Malformed { origin: String, reason: String },
}

/// One entry of the `projects` mapping
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectEntry {
    #[serde(rename = "type")]
    pub image: String,

    #[serde(default)]
    pub strategy: Option<String>,

    #[serde(default)]
    pub unimportant: bool,

    #[serde(default)]
    pub config: Option<Map<String, JsonValue>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    projects: Option<BTreeMap<String, ProjectEntry>>,
}

impl Manifest {
    /// Parses a YAML (or JSON) manifest; blank text declares no projects
    pub fn parse(text: &str, origin: &str) -> Result<Self, ManifestError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_yaml::from_str(text).map_err(|e| ManifestError::Malformed {
            origin: origin.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn into_projects(self) -> BTreeMap<String, ProjectEntry> {
        self.projects.unwrap_or_default()
    }
}

/// Manifest text together with where it came from
#[derive(Debug)]
pub struct ManifestSource {
    pub origin: String,
    pub text: Result<String, ManifestError>,
}

impl ManifestSource {
    pub fn new(origin: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            text: Ok(text.into()),
        }
    }

    /// A source that could not be loaded
    pub fn unreadable(origin: impl Into<String>, reason: impl ToString) -> Self {
        let origin = origin.into();
        Self {
            text: Err(ManifestError::Unreadable {
                origin: origin.clone(),
                reason: reason.to_string(),
            }),
            origin,
        }
    }

    /// Reads a manifest file from the host
    pub async fn from_file(path: &Path) -> Self {
        let origin = path.display().to_string();
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Self::new(origin, text),
            Err(e) => Self::unreadable(origin, e),
        }
    }
}
