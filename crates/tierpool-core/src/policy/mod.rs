//! Policy Engine: turns capacity and temperature into a migration plan.

mod engine;
mod plan;

pub use engine::{PolicyEngine, PolicyInput};
pub use plan::{FlagReason, FlaggedPath, Plan, PlannedMove, Rejection};
