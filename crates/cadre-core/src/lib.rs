//! Core execution engine for Cadre.
//!
//! Cadre drives autonomous agents: each agent iteratively asks a language
//! model what to do, executes the tools the model chose, and folds the
//! results back into its context until the task converges. Multiple agents
//! compose into a dependency-ordered workflow planned by a model and
//! executed concurrently where the graph allows.
//!
//! The pieces, leaves first:
//!
//! - [`context`]: per-task and per-agent-run state, and the task store
//! - [`tools`]: the tool contract, registry, and the remote tool-listing
//!   collaborator interface
//! - [`agent`]: the iterate-observe-act loop with stream folding and
//!   history compression
//! - [`planning`]: the plan document model, its incremental parser, and
//!   the planner
//! - [`workflow`]: DAG validation and the cooperative graph executor
//! - [`orchestrator`]: thin composition of all of the above

pub mod agent;
pub mod chain;
pub mod config;
pub mod context;
pub mod error;
pub mod orchestrator;
pub mod planning;
pub mod tools;
pub mod workflow;

pub use agent::{
    AgentDefinition, AgentObserver, AgentRunner, LocationRefreshPolicy, NoopObserver,
    ToolRefreshPolicy,
};
pub use chain::{AgentChain, PlanningRecord, ToolRecord};
pub use config::{RunnerConfig, UNFINISHED};
pub use context::{AgentContext, TaskContext, TaskStore};
pub use error::{CoreError, Result};
pub use orchestrator::Orchestrator;
pub use planning::{AgentTask, PlanNode, PlanObserver, Planner, Workflow};
pub use tools::{
    ListToolsParams, RemoteTool, RemoteToolService, Tool, ToolRegistry, ToolResult,
};
pub use workflow::{
    GraphError, GraphExecutor, HookDecision, NodeAction, NodeHook, NodeInput, WorkflowGraph,
    WorkflowNode,
};
