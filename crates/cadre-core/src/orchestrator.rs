//! Thin composition of planner, workflow executor, and agent runs.
//!
//! The orchestrator owns the configured agents and the task store:
//! `generate` plans a workflow and registers the task, `execute` turns each
//! planned agent into a workflow node whose action runs that agent's loop,
//! and `abort` trips the task's cancellation token. Tasks leave the store
//! on completion or abort.

use crate::agent::{AgentDefinition, AgentObserver, AgentRunner, NoopObserver};
use crate::config::RunnerConfig;
use crate::context::{AgentContext, TaskContext, TaskStore};
use crate::error::{CoreError, Result};
use crate::planning::{AgentTask, PlanObserver, Planner, Workflow};
use crate::tools::RemoteToolService;
use crate::workflow::{GraphExecutor, NodeAction, NodeInput, WorkflowGraph, WorkflowNode};
use async_trait::async_trait;
use cadre_abstraction::LanguageModel;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::info;

/// Composes planning and multi-agent execution.
pub struct Orchestrator {
    llm: Arc<dyn LanguageModel>,
    agents: Vec<Arc<AgentDefinition>>,
    store: Arc<TaskStore>,
    config: RunnerConfig,
    planner: Planner,
    remote_tools: Option<Arc<dyn RemoteToolService>>,
    observer: Arc<dyn AgentObserver>,
}

impl Orchestrator {
    /// Creates an orchestrator over the given model client and agents.
    pub fn new(llm: Arc<dyn LanguageModel>, agents: Vec<Arc<AgentDefinition>>) -> Self {
        Self {
            llm,
            agents,
            store: Arc::new(TaskStore::new()),
            config: RunnerConfig::default(),
            planner: Planner::new(),
            remote_tools: None,
            observer: Arc::new(NoopObserver),
        }
    }

    /// Overrides the runner configuration.
    #[must_use]
    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses a shared task store instead of a private one.
    #[must_use]
    pub fn with_task_store(mut self, store: Arc<TaskStore>) -> Self {
        self.store = store;
        self
    }

    /// Sets the remote tool-listing collaborator for agent runs.
    #[must_use]
    pub fn with_remote_tools(mut self, remote: Arc<dyn RemoteToolService>) -> Self {
        self.remote_tools = Some(remote);
        self
    }

    /// Sets the observer forwarded to every agent run.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn AgentObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// The task store.
    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// Plans a workflow for the prompt and registers the task.
    pub async fn generate(
        &self,
        prompt: &str,
        observer: &dyn PlanObserver,
    ) -> Result<Arc<TaskContext>> {
        let task = Arc::new(TaskContext::new(
            Arc::clone(&self.llm),
            self.agents.clone(),
            self.config.clone(),
        ));
        self.store.insert(Arc::clone(&task));

        match self.planner.plan(&task, prompt, observer).await {
            Ok(_) => Ok(task),
            Err(e) => {
                // A task whose planning failed never becomes executable.
                self.store.remove(&task.task_id);
                Err(e)
            }
        }
    }

    /// Replans a registered task with a new instruction, preserving the
    /// prior planning exchange as history.
    pub async fn replan(
        &self,
        task_id: &str,
        instruction: &str,
        observer: &dyn PlanObserver,
    ) -> Result<Workflow> {
        let task = self
            .store
            .get(task_id)
            .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()))?;
        self.planner.replan(&task, instruction, observer).await
    }

    /// Executes a planned task, returning each agent's final text by name.
    /// The task is removed from the store when execution finishes, whether
    /// it succeeded or not.
    pub async fn execute(&self, task_id: &str) -> Result<HashMap<String, String>> {
        let task = self
            .store
            .get(task_id)
            .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()))?;
        let workflow = task
            .workflow()
            .ok_or_else(|| CoreError::MissingWorkflow(task_id.to_string()))?;

        let result = self.run_workflow(&task, &workflow).await;
        self.store.remove(task_id);
        result
    }

    /// Cancels a task and drops it from the store. Returns whether the
    /// task was registered.
    pub fn abort(&self, task_id: &str) -> bool {
        match self.store.remove(task_id) {
            Some(task) => {
                info!(task_id = %task_id, "Aborting task");
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }

    async fn run_workflow(
        &self,
        task: &Arc<TaskContext>,
        workflow: &Workflow,
    ) -> Result<HashMap<String, String>> {
        let mut nodes = Vec::with_capacity(workflow.agents.len());
        let mut previous: Option<String> = None;
        for agent_task in &workflow.agents {
            let definition = task
                .agent(&agent_task.name)
                .ok_or_else(|| CoreError::UnknownAgent(agent_task.name.clone()))?;

            // Explicit dependsOn wins; otherwise chain document order.
            let deps = if agent_task.depends_on.is_empty() {
                previous.iter().cloned().collect()
            } else {
                agent_task.depends_on.clone()
            };

            let action = AgentNodeAction {
                definition,
                agent_task: agent_task.clone(),
                remote_tools: self.remote_tools.clone(),
                observer: Arc::clone(&self.observer),
            };
            nodes.push(
                WorkflowNode::new(agent_task.name.clone(), Arc::new(action)).with_deps(deps),
            );
            previous = Some(agent_task.name.clone());
        }

        let graph = WorkflowGraph::new(nodes)?;
        let outputs = GraphExecutor::new().execute(&graph, task).await?;

        Ok(outputs
            .into_iter()
            .map(|(id, value)| match value {
                Value::String(text) => (id, text),
                other => (id, other.to_string()),
            })
            .collect())
    }
}

/// Runs one planned agent as a workflow node.
struct AgentNodeAction {
    definition: Arc<AgentDefinition>,
    agent_task: AgentTask,
    remote_tools: Option<Arc<dyn RemoteToolService>>,
    observer: Arc<dyn AgentObserver>,
}

#[async_trait]
impl NodeAction for AgentNodeAction {
    async fn run(
        &self,
        node: &WorkflowNode,
        input: NodeInput,
        task: Arc<TaskContext>,
    ) -> anyhow::Result<Value> {
        // The plan's textual form is the literal prompt for the agent,
        // extended with whatever its dependencies produced.
        let mut prompt = self.agent_task.to_prompt();
        if !input.dependencies.is_empty() {
            prompt.push_str("\n\nResults from dependency agents:");
            let mut deps: Vec<_> = input.dependencies.iter().collect();
            deps.sort_by(|a, b| a.0.cmp(b.0));
            for (name, value) in deps {
                let text = match value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                let _ = write!(prompt, "\n### {}\n{}", name, text);
            }
        }

        let mut runner = AgentRunner::new().with_observer(Arc::clone(&self.observer));
        if let Some(remote) = &self.remote_tools {
            runner = runner.with_remote_tools(Arc::clone(remote));
        }

        let mut ctx = AgentContext::new(task, Arc::clone(&self.definition), &prompt);
        ctx.node_id = Some(node.id.clone());

        let text = runner.run(&mut ctx, &prompt).await?;
        Ok(Value::String(text))
    }
}
