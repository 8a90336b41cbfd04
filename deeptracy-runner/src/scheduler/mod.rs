//! Scheduler layer for the runner
//!
//! The build graph engine: it turns scheduler triggers into builds, runs
//! each build's stage through the execution service and coordinates the
//! fan-out/fan-in between parents and children.

mod context;
mod engine;
mod error;

pub use context::StageContext;
pub use engine::{BuildEngine, BuildOutcome, BuildRef, EngineSettings, FanIn, reduce};
pub use error::EngineError;
