//! Analysis DTOs for backend and task communication

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Request registering a new analysis with the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAnalysis {
    pub repo: String,
    pub commit: String,
    pub notify: String,
}

/// Backend response to [`RegisterAnalysis`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRegistered {
    pub id: String,
}

/// Body of the `extraction/succeeded` signal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionSucceeded {
    pub task_count: i64,
}

/// Document a task container prints on stdout when it finishes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskReport {
    #[serde(default)]
    pub dependencies: Option<JsonValue>,
    #[serde(default)]
    pub vulnerabilities: Option<JsonValue>,
}
