//! Plan document model, incremental parsing, and the planner.

pub mod parser;
pub mod plan;
pub mod planner;

pub use parser::{parse_final, parse_prefix, PlanError};
pub use plan::{AgentTask, PlanNode, Workflow};
pub use planner::{NoopPlanObserver, PlanObserver, Planner};
