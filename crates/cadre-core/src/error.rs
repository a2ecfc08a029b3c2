//! Error types for the execution engine.

use cadre_abstraction::ModelError;
use thiserror::Error;

/// Errors surfaced by agent runs, planning, and workflow execution.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A model call failed terminally (every backend exhausted, or a
    /// protocol error mid-stream).
    #[error(transparent)]
    Model(#[from] ModelError),

    /// An agent exceeded its consecutive tool-failure budget.
    #[error("agent '{agent}' aborted after {count} consecutive tool failures: {last_error}")]
    ToolFailuresExhausted {
        /// The agent whose run was terminated.
        agent: String,
        /// How many consecutive failures were observed.
        count: u32,
        /// Text of the last failing tool result.
        last_error: String,
    },

    /// The task was cancelled cooperatively.
    #[error("task cancelled")]
    Cancelled,

    /// Workflow graph validation or execution failed.
    #[error(transparent)]
    Graph(#[from] crate::workflow::GraphError),

    /// The completed plan document could not be parsed.
    #[error(transparent)]
    Plan(#[from] crate::planning::PlanError),

    /// No task registered under the given id.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// The task has no resolved workflow yet; plan before executing.
    #[error("task '{0}' has no resolved workflow")]
    MissingWorkflow(String),

    /// A plan references an agent that is not configured.
    #[error("plan references unknown agent: {0}")]
    UnknownAgent(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, CoreError>;
