//! Task and agent execution state.
//!
//! A [`TaskContext`] is created when a task starts and shared by everything
//! that works on it: the planner, the workflow executor, and each agent
//! run. An [`AgentContext`] wraps the task context for the duration of one
//! agent run and is discarded when the run returns.

use crate::agent::AgentDefinition;
use crate::chain::{AgentChain, PlanningRecord};
use crate::config::RunnerConfig;
use crate::planning::Workflow;
use cadre_abstraction::LanguageModel;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Shared per-task state.
///
/// The variable store is shared, without per-key write serialization,
/// across every agent and workflow node of the task: callers must
/// partition keys to avoid races.
pub struct TaskContext {
    /// Unique task id.
    pub task_id: String,
    /// The failover model client serving this task.
    pub llm: Arc<dyn LanguageModel>,
    /// Agents available to the planner and executor.
    pub agents: Vec<Arc<AgentDefinition>>,
    /// Cooperative cancellation signal for the whole task.
    pub cancel: CancellationToken,
    /// Runner tunables.
    pub config: RunnerConfig,
    /// Shared key/value variable store.
    variables: RwLock<HashMap<String, Value>>,
    /// The resolved workflow, once planned.
    workflow: RwLock<Option<Workflow>>,
    /// Raw request/response of the latest planning exchange.
    planning: Mutex<Option<PlanningRecord>>,
    /// Chains of every agent run started under this task.
    chains: Mutex<Vec<Arc<Mutex<AgentChain>>>>,
}

impl TaskContext {
    /// Creates a task context with a fresh id.
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        agents: Vec<Arc<AgentDefinition>>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            llm,
            agents,
            cancel: CancellationToken::new(),
            config,
            variables: RwLock::new(HashMap::new()),
            workflow: RwLock::new(None),
            planning: Mutex::new(None),
            chains: Mutex::new(Vec::new()),
        }
    }

    /// Reads a variable.
    pub fn get_variable(&self, key: &str) -> Option<Value> {
        self.variables.read().expect("variables lock").get(key).cloned()
    }

    /// Writes a variable, returning the previous value if any.
    pub fn set_variable(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.variables.write().expect("variables lock").insert(key.into(), value)
    }

    /// The resolved workflow, if planning has completed.
    pub fn workflow(&self) -> Option<Workflow> {
        self.workflow.read().expect("workflow lock").clone()
    }

    /// Stores the resolved workflow.
    pub fn set_workflow(&self, workflow: Workflow) {
        *self.workflow.write().expect("workflow lock") = Some(workflow);
    }

    /// The latest planning exchange, if any.
    pub fn planning_record(&self) -> Option<PlanningRecord> {
        self.planning.lock().expect("planning lock").clone()
    }

    /// Stores the latest planning exchange.
    pub fn set_planning_record(&self, record: PlanningRecord) {
        *self.planning.lock().expect("planning lock") = Some(record);
    }

    /// Looks up an agent definition by name.
    pub fn agent(&self, name: &str) -> Option<Arc<AgentDefinition>> {
        self.agents.iter().find(|a| a.name == name).cloned()
    }

    /// Registers an agent run's chain for observability.
    pub fn register_chain(&self, chain: Arc<Mutex<AgentChain>>) {
        self.chains.lock().expect("chains lock").push(chain);
    }

    /// Snapshot of every agent chain recorded so far.
    pub fn chains(&self) -> Vec<AgentChain> {
        self.chains
            .lock()
            .expect("chains lock")
            .iter()
            .map(|c| c.lock().expect("chain lock").clone())
            .collect()
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("agents", &self.agents.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Explicit task registry with a defined lifecycle: tasks are registered
/// when planning starts and removed on completion or abort.
#[derive(Default)]
pub struct TaskStore {
    tasks: RwLock<HashMap<String, Arc<TaskContext>>>,
}

impl TaskStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task.
    pub fn insert(&self, task: Arc<TaskContext>) {
        debug!(task_id = %task.task_id, "Registering task");
        self.tasks.write().expect("tasks lock").insert(task.task_id.clone(), task);
    }

    /// Looks up a task by id.
    pub fn get(&self, task_id: &str) -> Option<Arc<TaskContext>> {
        self.tasks.read().expect("tasks lock").get(task_id).cloned()
    }

    /// Removes a task, returning it if present.
    pub fn remove(&self, task_id: &str) -> Option<Arc<TaskContext>> {
        debug!(task_id = %task_id, "Removing task");
        self.tasks.write().expect("tasks lock").remove(task_id)
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.tasks.read().expect("tasks lock").len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancels every registered task and clears the store.
    pub fn abort_all(&self) {
        let mut tasks = self.tasks.write().expect("tasks lock");
        for task in tasks.values() {
            task.cancel.cancel();
        }
        tasks.clear();
    }
}

/// Per-agent-run state wrapping a [`TaskContext`].
pub struct AgentContext {
    /// The owning task.
    pub task: Arc<TaskContext>,
    /// The agent being run.
    pub agent: Arc<AgentDefinition>,
    /// The workflow node this run serves, when executing a plan.
    pub node_id: Option<String>,
    /// Running count of consecutive tool failures.
    pub consecutive_tool_errors: u32,
    /// This run's history record.
    pub chain: Arc<Mutex<AgentChain>>,
    /// Variables private to this run.
    variables: HashMap<String, Value>,
}

impl AgentContext {
    /// Creates the context for one agent run and registers its chain on
    /// the task.
    pub fn new(task: Arc<TaskContext>, agent: Arc<AgentDefinition>, task_prompt: &str) -> Self {
        let chain = Arc::new(Mutex::new(AgentChain::new(agent.name.clone(), task_prompt)));
        task.register_chain(Arc::clone(&chain));
        Self {
            task,
            agent,
            node_id: None,
            consecutive_tool_errors: 0,
            chain,
            variables: HashMap::new(),
        }
    }

    /// Reads a run-private variable.
    pub fn get_variable(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    /// Writes a run-private variable.
    pub fn set_variable(&mut self, key: impl Into<String>, value: Value) {
        self.variables.insert(key.into(), value);
    }
}
