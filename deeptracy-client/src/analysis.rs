//! Analysis lifecycle signals
//!
//! The catalogue of signals the pipeline stages send to the backend. Each
//! function returns a fresh [`SignalEvent`]; callers may tighten it (e.g.
//! mark it required) before sending.

use deeptracy_core::domain::property::Property;
use deeptracy_core::domain::signal::{Method, SignalCondition, SignalEvent};
use serde_json::json;

/// Register a new analysis and harvest its id
///
/// Fires only when the launching build carries no `analysis_id` yet.
pub fn register_analysis() -> SignalEvent {
    SignalEvent::new("register-analysis", Method::Post, "/analysis/")
        .with_payload(json!({
            "repo": "{repo}",
            "commit": "{commit}",
            "notify": "{notify}",
        }))
        .when(SignalCondition::IfAbsent(Property::AnalysisId))
        .harvest("id", Property::AnalysisId.name())
        .required()
}

pub fn extraction_started() -> SignalEvent {
    SignalEvent::new(
        "extraction-started",
        Method::Put,
        "/analysis/{analysis_id}/extraction/started",
    )
}

/// Report how many tasks bootstrap discovered
pub fn extraction_succeeded() -> SignalEvent {
    SignalEvent::new(
        "extraction-succeeded",
        Method::Put,
        "/analysis/{analysis_id}/extraction/succeeded",
    )
    .with_payload(json!({ "task_count": "{task_count}" }))
    .when(SignalCondition::IfPresent(Property::TaskCount))
}

/// Report a bootstrap that never got as far as counting its tasks
pub fn extraction_failed() -> SignalEvent {
    SignalEvent::new(
        "extraction-failed",
        Method::Put,
        "/analysis/{analysis_id}/extraction/failed",
    )
    .when(SignalCondition::IfAbsent(Property::TaskCount))
}

pub fn dependencies_report() -> SignalEvent {
    SignalEvent::new(
        "dependencies",
        Method::Post,
        "/analysis/{analysis_id}/{execution_id}/dependencies",
    )
    .with_payload(json!("{dependencies}"))
    .when(SignalCondition::IfPresent(Property::Dependencies))
}

pub fn vulnerabilities_report() -> SignalEvent {
    SignalEvent::new(
        "vulnerabilities",
        Method::Post,
        "/analysis/{analysis_id}/{execution_id}/vulnerabilities",
    )
    .with_payload(json!("{vulnerabilities}"))
    .when(SignalCondition::IfPresent(Property::Vulnerabilities))
}

/// Close the analysis with its terminal status and every dependency found
///
/// Launch sends this once bootstrap is terminal, whether it succeeded or not.
pub fn analysis_finished() -> SignalEvent {
    SignalEvent::new("analysis-finished", Method::Post, "/analysis/{analysis_id}")
        .with_payload(json!({
            "status": "{analysis_status}",
            "dependencies": "{dependencies}",
        }))
        .when(SignalCondition::IfPresent(Property::AnalysisStatus))
}
