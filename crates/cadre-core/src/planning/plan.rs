//! The structured multi-agent plan.
//!
//! A [`Workflow`] is the parsed form of the plan document the planner
//! streams out of the model. Each [`AgentTask`]'s XML rendering is also the
//! literal prompt re-fed to that agent, so the rendering here and the
//! parser must stay in sync.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// A planned multi-agent workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    /// Workflow name.
    pub name: String,
    /// The planner's free-form reasoning, if it emitted any.
    pub thought: Option<String>,
    /// Per-agent task descriptors, in document order.
    pub agents: Vec<AgentTask>,
}

impl Workflow {
    /// Looks up an agent descriptor by name.
    pub fn agent(&self, name: &str) -> Option<&AgentTask> {
        self.agents.iter().find(|a| a.name == name)
    }
}

/// One agent's slice of the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentTask {
    /// The agent to run.
    pub name: String,
    /// Ids (agent names) this agent depends on. Empty means the planner
    /// left ordering implicit; the orchestrator then chains document order.
    pub depends_on: Vec<String>,
    /// Task description.
    pub task: String,
    /// Step nodes, in order.
    pub nodes: Vec<PlanNode>,
}

impl AgentTask {
    /// Renders this agent's subtree as the prompt re-fed to the agent.
    pub fn to_prompt(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "<agent name=\"{}\">", escape(&self.name));
        let _ = writeln!(out, "  <task>{}</task>", escape(&self.task));
        let _ = writeln!(out, "  <nodes>");
        for node in &self.nodes {
            node.render(&mut out, 4);
        }
        let _ = writeln!(out, "  </nodes>");
        out.push_str("</agent>");
        out
    }
}

/// One step of an agent's plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PlanNode {
    /// A sequential text step.
    Step {
        /// Step description.
        text: String,
        /// Variable-store key read before the step, if any.
        input: Option<String>,
        /// Variable-store key written after the step, if any.
        output: Option<String>,
    },
    /// Repeat the inner nodes over a named collection.
    ForEach {
        /// What to iterate over (a variable key or description).
        items: String,
        /// Body nodes.
        nodes: Vec<PlanNode>,
    },
    /// Watch for an event and run the trigger nodes when it fires.
    Watch {
        /// The event to watch for.
        event: String,
        /// Whether to keep watching after the first trigger.
        #[serde(rename = "loop")]
        repeat: bool,
        /// What is being watched, in prose.
        description: String,
        /// Nodes to run when the event fires.
        triggers: Vec<PlanNode>,
    },
}

impl PlanNode {
    fn render(&self, out: &mut String, indent: usize) {
        let pad = " ".repeat(indent);
        match self {
            PlanNode::Step { text, input, output } => {
                let mut attrs = String::new();
                if let Some(input) = input {
                    let _ = write!(attrs, " input=\"{}\"", escape(input));
                }
                if let Some(output) = output {
                    let _ = write!(attrs, " output=\"{}\"", escape(output));
                }
                let _ = writeln!(out, "{}<node{}>{}</node>", pad, attrs, escape(text));
            }
            PlanNode::ForEach { items, nodes } => {
                let _ = writeln!(out, "{}<forEach items=\"{}\">", pad, escape(items));
                for node in nodes {
                    node.render(out, indent + 2);
                }
                let _ = writeln!(out, "{}</forEach>", pad);
            }
            PlanNode::Watch { event, repeat, description, triggers } => {
                let _ = writeln!(
                    out,
                    "{}<watch event=\"{}\" loop=\"{}\">",
                    pad,
                    escape(event),
                    repeat
                );
                let _ = writeln!(
                    out,
                    "{}  <description>{}</description>",
                    pad,
                    escape(description)
                );
                let _ = writeln!(out, "{}  <trigger>", pad);
                for node in triggers {
                    node.render(out, indent + 4);
                }
                let _ = writeln!(out, "{}  </trigger>", pad);
                let _ = writeln!(out, "{}</watch>", pad);
            }
        }
    }
}

/// Escapes text for embedding in the plan document.
pub(crate) fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_task_prompt_rendering() {
        let agent = AgentTask {
            name: "browser".to_string(),
            depends_on: Vec::new(),
            task: "Collect pricing data".to_string(),
            nodes: vec![
                PlanNode::Step {
                    text: "Open the pricing page".to_string(),
                    input: None,
                    output: Some("page".to_string()),
                },
                PlanNode::ForEach {
                    items: "plans".to_string(),
                    nodes: vec![PlanNode::Step {
                        text: "Record the plan's price".to_string(),
                        input: None,
                        output: None,
                    }],
                },
            ],
        };

        let prompt = agent.to_prompt();
        assert!(prompt.starts_with("<agent name=\"browser\">"));
        assert!(prompt.contains("<task>Collect pricing data</task>"));
        assert!(prompt.contains("<node output=\"page\">Open the pricing page</node>"));
        assert!(prompt.contains("<forEach items=\"plans\">"));
        assert!(prompt.ends_with("</agent>"));
    }

    #[test]
    fn test_escape_special_characters() {
        assert_eq!(escape("a < b & c"), "a &lt; b &amp; c");
    }
}
