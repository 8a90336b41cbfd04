//! Service layer
//!
//! Services contain the business logic of the pipeline stages. The engine
//! drives them through the [`ExecutionService`] trait, so the scheduler can
//! be exercised with scripted stages in tests.

mod analyze;
mod bootstrap;
mod error;
mod execution;
mod launch;

pub use error::StageError;
pub use execution::{ExecutionService, StageSettings, StandardExecutionService};
pub use launch::DEFAULT_COMMIT;
