//! Workflow graph execution.
//!
//! Resolves terminal nodes concurrently; each node first resolves its
//! dependencies, memoized through a shared state map so diamond-shaped
//! graphs run every node exactly once. Concurrency is cooperative: branches
//! interleave at await points, nothing is spawned onto other threads.

use crate::context::TaskContext;
use crate::workflow::graph::{
    GraphError, NodeInput, Result, WorkflowGraph, WorkflowNode,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a hook wants done with a node about to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookDecision {
    /// Run the node normally.
    Continue,
    /// Omit the node without failing the graph.
    Skip,
    /// Abort the whole workflow.
    Abort,
}

/// Per-node observation hooks, evaluated before each node's action runs.
#[async_trait]
pub trait NodeHook: Send + Sync {
    /// Decides whether the node runs.
    async fn before_node(&self, _node: &WorkflowNode, _task: &TaskContext) -> HookDecision {
        HookDecision::Continue
    }

    /// Called after a node completed successfully.
    async fn after_node(&self, _node: &WorkflowNode, _output: &Value) {}
}

/// A hook that lets everything run.
pub struct NoopHook;

#[async_trait]
impl NodeHook for NoopHook {}

/// Resolution state of one node.
enum NodeState {
    /// Some branch is currently resolving the node.
    Resolving,
    /// The node finished; `None` means it was skipped.
    Done(Option<Value>),
    /// The node (or one of its dependencies) failed.
    Failed(String),
}

/// Shared execution state for one run.
struct ExecState {
    states: Mutex<HashMap<String, NodeState>>,
    notify: Notify,
    abort: CancellationToken,
}

/// Executes a validated workflow graph to completion.
pub struct GraphExecutor {
    hook: Arc<dyn NodeHook>,
}

impl Default for GraphExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphExecutor {
    /// Creates an executor with no hooks.
    pub fn new() -> Self {
        Self { hook: Arc::new(NoopHook) }
    }

    /// Sets the per-node hook.
    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn NodeHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Runs the graph, returning every completed node's output by id.
    ///
    /// Validation runs first; a cyclic graph is refused before any node's
    /// action executes. Cancelling the task aborts in-flight and
    /// not-yet-started resolutions at their next checkpoint.
    pub async fn execute(
        &self,
        graph: &WorkflowGraph,
        task: &Arc<TaskContext>,
    ) -> Result<HashMap<String, Value>> {
        graph.validate()?;

        let exec = ExecState {
            states: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            abort: task.cancel.child_token(),
        };

        let terminals = graph.terminal_ids();
        info!(
            task_id = %task.task_id,
            nodes = graph.nodes().len(),
            terminals = terminals.len(),
            "Executing workflow graph"
        );

        let results = futures::future::join_all(
            terminals
                .iter()
                .map(|id| self.resolve(graph, &exec, task, id.clone(), HashSet::new())),
        )
        .await;
        for result in results {
            result?;
        }

        let states = exec.states.into_inner().expect("states lock");
        let outputs = states
            .into_iter()
            .filter_map(|(id, state)| match state {
                NodeState::Done(Some(value)) => Some((id, value)),
                _ => None,
            })
            .collect();
        Ok(outputs)
    }

    /// Resolves one node, after its dependencies.
    ///
    /// `stack` carries the ids on the current resolution chain: meeting one
    /// of them again is a cycle caught at runtime, a second line of defense
    /// behind [`WorkflowGraph::validate`].
    fn resolve<'a>(
        &'a self,
        graph: &'a WorkflowGraph,
        exec: &'a ExecState,
        task: &'a Arc<TaskContext>,
        node_id: String,
        stack: HashSet<String>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Value>>> + 'a>> {
        Box::pin(async move {
            if exec.abort.is_cancelled() {
                return Err(GraphError::Aborted);
            }
            if stack.contains(&node_id) {
                return Err(GraphError::ReentrantNode(node_id));
            }

            // Claim the node, or wait for the sibling branch that owns it.
            loop {
                let notified = exec.notify.notified();
                tokio::pin!(notified);
                // Register before re-checking state, so a finish() landing
                // in between cannot be missed.
                notified.as_mut().enable();
                {
                    let mut states = exec.states.lock().expect("states lock");
                    match states.get(&node_id) {
                        Some(NodeState::Done(value)) => return Ok(value.clone()),
                        Some(NodeState::Failed(message)) => {
                            return Err(GraphError::NodeFailed {
                                node: node_id,
                                message: message.clone(),
                            });
                        }
                        Some(NodeState::Resolving) => {}
                        None => {
                            states.insert(node_id.clone(), NodeState::Resolving);
                            break;
                        }
                    }
                }
                tokio::select! {
                    () = notified.as_mut() => {}
                    () = exec.abort.cancelled() => return Err(GraphError::Aborted),
                }
            }

            let node = graph.get(&node_id).expect("validated node id");
            let mut chain = stack;
            chain.insert(node_id.clone());

            // Resolve dependencies concurrently; they interleave with the
            // rest of the graph at await points.
            let dep_results = futures::future::join_all(
                node.deps
                    .iter()
                    .map(|dep| self.resolve(graph, exec, task, dep.clone(), chain.clone())),
            )
            .await;

            let mut dependencies = HashMap::new();
            for (dep, result) in node.deps.iter().zip(dep_results) {
                match result {
                    Ok(Some(value)) => {
                        dependencies.insert(dep.clone(), value);
                    }
                    Ok(None) => {
                        debug!(node = %node_id, dep = %dep, "Dependency was skipped");
                    }
                    Err(e) => {
                        self.finish(exec, &node_id, NodeState::Failed(e.to_string()));
                        return Err(e);
                    }
                }
            }

            match self.hook.before_node(node, task.as_ref()).await {
                HookDecision::Continue => {}
                HookDecision::Skip => {
                    debug!(node = %node_id, "Node skipped by hook");
                    self.finish(exec, &node_id, NodeState::Done(None));
                    return Ok(None);
                }
                HookDecision::Abort => {
                    warn!(node = %node_id, "Workflow aborted by hook");
                    exec.abort.cancel();
                    self.finish(exec, &node_id, NodeState::Failed("aborted".to_string()));
                    return Err(GraphError::Aborted);
                }
            }
            if exec.abort.is_cancelled() {
                self.finish(exec, &node_id, NodeState::Failed("aborted".to_string()));
                return Err(GraphError::Aborted);
            }

            let input = NodeInput {
                dependencies,
                variable: node.input.as_ref().and_then(|key| task.get_variable(key)),
            };

            debug!(node = %node_id, "Running node action");
            match node.action.run(node, input, Arc::clone(task)).await {
                Ok(value) => {
                    if let Some(key) = &node.output {
                        task.set_variable(key.clone(), value.clone());
                    }
                    self.hook.after_node(node, &value).await;
                    self.finish(exec, &node_id, NodeState::Done(Some(value.clone())));
                    Ok(Some(value))
                }
                Err(e) => {
                    warn!(node = %node_id, error = %e, "Node action failed");
                    let message = e.to_string();
                    self.finish(exec, &node_id, NodeState::Failed(message.clone()));
                    Err(GraphError::NodeFailed { node: node_id, message })
                }
            }
        })
    }

    fn finish(&self, exec: &ExecState, node_id: &str, state: NodeState) {
        exec.states.lock().expect("states lock").insert(node_id.to_string(), state);
        exec.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentDefinition;
    use crate::config::RunnerConfig;
    use cadre_models::MockProvider;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn task() -> Arc<TaskContext> {
        Arc::new(TaskContext::new(
            Arc::new(MockProvider::new("mock")),
            Vec::<Arc<AgentDefinition>>::new(),
            RunnerConfig::default(),
        ))
    }

    /// Appends its node id to a shared log, returning a fixed value.
    struct Recording {
        log: Arc<Mutex<Vec<String>>>,
        value: Value,
    }

    #[async_trait]
    impl crate::workflow::NodeAction for Recording {
        async fn run(
            &self,
            node: &WorkflowNode,
            _input: NodeInput,
            _task: Arc<TaskContext>,
        ) -> anyhow::Result<Value> {
            self.log.lock().expect("log lock").push(node.id.clone());
            Ok(self.value.clone())
        }
    }

    fn recording(log: &Arc<Mutex<Vec<String>>>, value: Value) -> Arc<Recording> {
        Arc::new(Recording { log: Arc::clone(log), value })
    }

    #[tokio::test]
    async fn test_dependencies_complete_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = WorkflowGraph::new(vec![
            WorkflowNode::new("a", recording(&log, json!("a-out"))),
            WorkflowNode::new("b", recording(&log, json!("b-out"))).with_deps(["a"]),
            WorkflowNode::new("c", recording(&log, json!("c-out"))).with_deps(["a", "b"]),
        ])
        .unwrap();

        let outputs = GraphExecutor::new().execute(&graph, &task()).await.unwrap();

        let order = log.lock().unwrap().clone();
        assert_eq!(order.len(), 3);
        let pos = |id: &str| order.iter().position(|n| n == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("c"));
        assert_eq!(outputs["c"], json!("c-out"));
    }

    #[tokio::test]
    async fn test_diamond_runs_shared_dependency_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = WorkflowGraph::new(vec![
            WorkflowNode::new("a", recording(&log, json!(1))),
            WorkflowNode::new("b", recording(&log, json!(2))).with_deps(["a"]),
            WorkflowNode::new("c", recording(&log, json!(3))).with_deps(["a"]),
            WorkflowNode::new("d", recording(&log, json!(4))).with_deps(["b", "c"]),
        ])
        .unwrap();

        GraphExecutor::new().execute(&graph, &task()).await.unwrap();

        let order = log.lock().unwrap().clone();
        assert_eq!(order.iter().filter(|n| n.as_str() == "a").count(), 1);
        assert_eq!(order.len(), 4);
    }

    #[tokio::test]
    async fn test_cycle_refused_before_any_action() {
        let counter = Arc::new(AtomicUsize::new(0));

        struct Counting(Arc<AtomicUsize>);

        #[async_trait]
        impl crate::workflow::NodeAction for Counting {
            async fn run(
                &self,
                _node: &WorkflowNode,
                _input: NodeInput,
                _task: Arc<TaskContext>,
            ) -> anyhow::Result<Value> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        }

        let graph = WorkflowGraph::new(vec![
            WorkflowNode::new("a", Arc::new(Counting(Arc::clone(&counter)))).with_deps(["b"]),
            WorkflowNode::new("b", Arc::new(Counting(Arc::clone(&counter)))).with_deps(["a"]),
        ])
        .unwrap();

        let err = GraphExecutor::new().execute(&graph, &task()).await.unwrap_err();
        assert!(matches!(err, GraphError::CycleDetected(_)));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dependency_outputs_assembled_by_id() {
        let log = Arc::new(Mutex::new(Vec::new()));

        struct Inspect {
            seen: Arc<Mutex<Option<NodeInput>>>,
        }

        #[async_trait]
        impl crate::workflow::NodeAction for Inspect {
            async fn run(
                &self,
                _node: &WorkflowNode,
                input: NodeInput,
                _task: Arc<TaskContext>,
            ) -> anyhow::Result<Value> {
                *self.seen.lock().expect("seen lock") = Some(input);
                Ok(Value::Null)
            }
        }

        let seen = Arc::new(Mutex::new(None));
        let graph = WorkflowGraph::new(vec![
            WorkflowNode::new("a", recording(&log, json!("alpha"))),
            WorkflowNode::new("b", Arc::new(Inspect { seen: Arc::clone(&seen) }))
                .with_deps(["a"]),
        ])
        .unwrap();

        GraphExecutor::new().execute(&graph, &task()).await.unwrap();

        let input = seen.lock().unwrap().take().unwrap();
        assert_eq!(input.dependencies["a"], json!("alpha"));
    }

    #[tokio::test]
    async fn test_skip_hook_omits_node_without_failing() {
        struct SkipB;

        #[async_trait]
        impl NodeHook for SkipB {
            async fn before_node(&self, node: &WorkflowNode, _task: &TaskContext) -> HookDecision {
                if node.id == "b" { HookDecision::Skip } else { HookDecision::Continue }
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = WorkflowGraph::new(vec![
            WorkflowNode::new("a", recording(&log, json!(1))),
            WorkflowNode::new("b", recording(&log, json!(2))).with_deps(["a"]),
            WorkflowNode::new("c", recording(&log, json!(3))).with_deps(["b"]),
        ])
        .unwrap();

        let outputs = GraphExecutor::new()
            .with_hook(Arc::new(SkipB))
            .execute(&graph, &task())
            .await
            .unwrap();

        let order = log.lock().unwrap().clone();
        assert!(!order.contains(&"b".to_string()));
        assert!(order.contains(&"c".to_string()));
        assert!(!outputs.contains_key("b"));
    }

    #[tokio::test]
    async fn test_abort_hook_fails_the_run() {
        struct AbortB;

        #[async_trait]
        impl NodeHook for AbortB {
            async fn before_node(&self, node: &WorkflowNode, _task: &TaskContext) -> HookDecision {
                if node.id == "b" { HookDecision::Abort } else { HookDecision::Continue }
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = WorkflowGraph::new(vec![
            WorkflowNode::new("a", recording(&log, json!(1))),
            WorkflowNode::new("b", recording(&log, json!(2))).with_deps(["a"]),
        ])
        .unwrap();

        let err = GraphExecutor::new()
            .with_hook(Arc::new(AbortB))
            .execute(&graph, &task())
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Aborted));
    }

    #[tokio::test]
    async fn test_cancelled_task_aborts_execution() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph =
            WorkflowGraph::new(vec![WorkflowNode::new("a", recording(&log, json!(1)))])
                .unwrap();

        let task = task();
        task.cancel.cancel();
        let err = GraphExecutor::new().execute(&graph, &task).await.unwrap_err();
        assert!(matches!(err, GraphError::Aborted));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_output_slot_writes_variable_store() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = WorkflowGraph::new(vec![
            WorkflowNode::new("a", recording(&log, json!("result")))
                .with_output_key("collected")
        ])
        .unwrap();

        let task = task();
        GraphExecutor::new().execute(&graph, &task).await.unwrap();
        assert_eq!(task.get_variable("collected"), Some(json!("result")));
    }

    #[tokio::test]
    async fn test_failed_node_fails_dependents() {
        struct Boom;

        #[async_trait]
        impl crate::workflow::NodeAction for Boom {
            async fn run(
                &self,
                _node: &WorkflowNode,
                _input: NodeInput,
                _task: Arc<TaskContext>,
            ) -> anyhow::Result<Value> {
                anyhow::bail!("exploded")
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = WorkflowGraph::new(vec![
            WorkflowNode::new("a", Arc::new(Boom)),
            WorkflowNode::new("b", recording(&log, json!(2))).with_deps(["a"]),
        ])
        .unwrap();

        let err = GraphExecutor::new().execute(&graph, &task()).await.unwrap_err();
        assert!(matches!(err, GraphError::NodeFailed { .. }));
        assert!(log.lock().unwrap().is_empty());
    }
}
