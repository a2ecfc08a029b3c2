//! Workflow graph construction and validation.
//!
//! Builds a directed graph from node dependencies and validates it before
//! any execution side effect: unique ids, resolvable dependency references,
//! and acyclicity, with cycle paths reported for debugging.

use crate::context::TaskContext;
use async_trait::async_trait;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Errors from workflow graph validation and execution.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Circular dependency detected.
    #[error("circular dependency detected: {0}")]
    CycleDetected(String),

    /// Two nodes share an id.
    #[error("duplicate node id: {0}")]
    DuplicateNode(String),

    /// A dependency references a node that does not exist.
    #[error("dependency node not found: {0}")]
    UnknownDependency(String),

    /// A node was asked to resolve while already on the resolution stack.
    #[error("node '{0}' re-entered while resolving")]
    ReentrantNode(String),

    /// The workflow was aborted.
    #[error("workflow aborted")]
    Aborted,

    /// A node's action failed.
    #[error("node '{node}' failed: {message}")]
    NodeFailed {
        /// The failing node's id.
        node: String,
        /// Failure description.
        message: String,
    },
}

/// Result type for graph operations.
pub type Result<T> = std::result::Result<T, GraphError>;

/// The input assembled for one node's action.
#[derive(Debug, Clone, Default)]
pub struct NodeInput {
    /// Outputs of this node's dependencies, keyed by dependency id.
    /// Skipped dependencies are absent.
    pub dependencies: HashMap<String, Value>,
    /// Value of the node's declared input variable, if one is set.
    pub variable: Option<Value>,
}

/// The executable unit bound to a workflow node.
#[async_trait]
pub trait NodeAction: Send + Sync {
    /// Runs the node. The returned value becomes the node's recorded
    /// output, visible to dependents.
    async fn run(
        &self,
        node: &WorkflowNode,
        input: NodeInput,
        task: Arc<TaskContext>,
    ) -> anyhow::Result<Value>;
}

/// One node of a workflow graph.
pub struct WorkflowNode {
    /// Unique node id.
    pub id: String,
    /// Ids of nodes that must complete before this one.
    pub deps: Vec<String>,
    /// Variable-store key read into the node's input, if any.
    pub input: Option<String>,
    /// Variable-store key the node's output is written to, if any.
    pub output: Option<String>,
    /// The executable unit.
    pub action: Arc<dyn NodeAction>,
}

impl WorkflowNode {
    /// Creates a node with no dependencies.
    pub fn new(id: impl Into<String>, action: Arc<dyn NodeAction>) -> Self {
        Self { id: id.into(), deps: Vec::new(), input: None, output: None, action }
    }

    /// Sets the dependency ids.
    #[must_use]
    pub fn with_deps(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.deps = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Declares the variable-store key read before the node runs.
    #[must_use]
    pub fn with_input_key(mut self, key: impl Into<String>) -> Self {
        self.input = Some(key.into());
        self
    }

    /// Declares the variable-store key the output is written to.
    #[must_use]
    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output = Some(key.into());
        self
    }
}

/// A validated set of workflow nodes.
pub struct WorkflowGraph {
    nodes: Vec<WorkflowNode>,
    index: HashMap<String, usize>,
}

impl WorkflowGraph {
    /// Builds a graph, rejecting duplicate ids and unknown dependencies.
    /// Cycle detection is a separate step ([`Self::validate`]) so callers
    /// can distinguish structural from ordering errors.
    pub fn new(nodes: Vec<WorkflowNode>) -> Result<Self> {
        let mut index = HashMap::new();
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateNode(node.id.clone()));
            }
        }
        for node in &nodes {
            for dep in &node.deps {
                if !index.contains_key(dep) {
                    return Err(GraphError::UnknownDependency(format!(
                        "{} (referenced by {})",
                        dep, node.id
                    )));
                }
            }
        }
        Ok(Self { nodes, index })
    }

    /// Looks up a node by id.
    pub fn get(&self, id: &str) -> Option<&WorkflowNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// All nodes, in insertion order.
    pub fn nodes(&self) -> &[WorkflowNode] {
        &self.nodes
    }

    /// Ids of terminal nodes: nodes no other node depends on.
    pub fn terminal_ids(&self) -> Vec<String> {
        let depended: HashSet<&String> =
            self.nodes.iter().flat_map(|n| n.deps.iter()).collect();
        self.nodes
            .iter()
            .filter(|n| !depended.contains(&n.id))
            .map(|n| n.id.clone())
            .collect()
    }

    /// Whether the dependency graph is free of cycles.
    pub fn is_acyclic(&self) -> bool {
        !is_cyclic_directed(&self.petgraph().0)
    }

    /// Validates acyclicity, reporting the cycle path on failure.
    pub fn validate(&self) -> Result<()> {
        let (graph, id_map) = self.petgraph();
        if is_cyclic_directed(&graph) {
            return Err(GraphError::CycleDetected(find_cycle_path(&graph, &id_map)));
        }
        Ok(())
    }

    /// Builds the petgraph view with edges from dependency to dependent.
    fn petgraph(&self) -> (DiGraph<String, ()>, HashMap<NodeIndex, String>) {
        let mut graph = DiGraph::new();
        let mut node_map = HashMap::new();
        let mut id_map = HashMap::new();
        for node in &self.nodes {
            let idx = graph.add_node(node.id.clone());
            node_map.insert(node.id.clone(), idx);
            id_map.insert(idx, node.id.clone());
        }
        for node in &self.nodes {
            let to = node_map[&node.id];
            for dep in &node.deps {
                let from = node_map[dep];
                graph.add_edge(from, to, ());
            }
        }
        (graph, id_map)
    }
}

/// Finds a cycle path in the graph for error reporting.
fn find_cycle_path(graph: &DiGraph<String, ()>, id_map: &HashMap<NodeIndex, String>) -> String {
    let mut visited = HashSet::new();
    let mut on_stack = HashSet::new();
    let mut path = Vec::new();

    for node in graph.node_indices() {
        if !visited.contains(&node)
            && dfs_cycle(graph, node, &mut visited, &mut on_stack, &mut path)
        {
            return path
                .iter()
                .map(|idx| id_map.get(idx).cloned().unwrap_or_else(|| "?".to_string()))
                .collect::<Vec<_>>()
                .join(" -> ");
        }
    }
    "unknown cycle".to_string()
}

/// DFS with an on-stack set; any node reachable from itself is a cycle.
fn dfs_cycle(
    graph: &DiGraph<String, ()>,
    node: NodeIndex,
    visited: &mut HashSet<NodeIndex>,
    on_stack: &mut HashSet<NodeIndex>,
    path: &mut Vec<NodeIndex>,
) -> bool {
    visited.insert(node);
    on_stack.insert(node);
    path.push(node);

    for neighbor in graph.neighbors_directed(node, Direction::Outgoing) {
        if !visited.contains(&neighbor) {
            if dfs_cycle(graph, neighbor, visited, on_stack, path) {
                return true;
            }
        } else if on_stack.contains(&neighbor) {
            path.push(neighbor);
            return true;
        }
    }

    on_stack.remove(&node);
    path.pop();
    false
}
