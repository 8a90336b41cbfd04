//! Build domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::property::PropertySet;

pub type BuildId = Uuid;

/// Pipeline stage a build executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Registers the analysis and triggers bootstrap
    Launch,
    /// Checks out the repository, expands manifests, fans out analyses
    Bootstrap,
    /// Runs one analysis task inside its task image
    Analyze,
}

impl StageKind {
    /// Name of the scheduler that triggers builds of this stage
    pub fn scheduler(&self) -> &'static str {
        match self {
            StageKind::Launch => "launch",
            StageKind::Bootstrap => "bootstrap",
            StageKind::Analyze => "analyze",
        }
    }

    pub fn from_scheduler(name: &str) -> Option<Self> {
        match name {
            "launch" => Some(StageKind::Launch),
            "bootstrap" => Some(StageKind::Bootstrap),
            "analyze" => Some(StageKind::Analyze),
            _ => None,
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.scheduler())
    }
}

/// Build execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Succeeded | BuildStatus::Failed | BuildStatus::Cancelled
        )
    }

    /// Whether `next` is a legal successor of this status
    pub fn can_transition_to(&self, next: BuildStatus) -> bool {
        match (self, next) {
            (BuildStatus::Pending, BuildStatus::Running | BuildStatus::Cancelled) => true,
            (
                BuildStatus::Running,
                BuildStatus::Succeeded | BuildStatus::Failed | BuildStatus::Cancelled,
            ) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildStatus::Pending => write!(f, "Pending"),
            BuildStatus::Running => write!(f, "Running"),
            BuildStatus::Succeeded => write!(f, "Succeeded"),
            BuildStatus::Failed => write!(f, "Failed"),
            BuildStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// One execution of a pipeline stage
///
/// The parent reference is a lookup key only: the parent waits for awaited
/// children but does not own them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub stage: StageKind,
    pub status: BuildStatus,
    pub properties: PropertySet,
    pub parent: Option<BuildId>,
    pub children: Vec<BuildId>,
    pub unimportant: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Build {
    pub fn new(
        stage: StageKind,
        properties: PropertySet,
        parent: Option<BuildId>,
        unimportant: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            stage,
            status: BuildStatus::Pending,
            properties,
            parent,
            children: Vec::new(),
            unimportant,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }
}
