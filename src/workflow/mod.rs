//! Checkpoint-driven workflow runtime.

pub mod executor;
pub mod schema;
pub mod subscriptions;

pub use executor::{BlockOutcome, CancelHandle, PlanExecutor, PlanRun};
pub use schema::*;

use crate::error::{Result, WebautoError};
use std::path::Path;

/// Load a plan definition from a JSON file.
pub fn load_plan(path: &Path) -> Result<Plan> {
    let text = std::fs::read_to_string(path)?;
    let plan: Plan = serde_json::from_str(&text)
        .map_err(|e| WebautoError::Validation(format!("Plan file {:?}: {}", path, e)))?;
    executor::PlanExecutor::validate(&plan)?;
    Ok(plan)
}
