//! Append-only run history.
//!
//! Each agent run owns an [`AgentChain`] recording every tool call it made,
//! plus accumulated token usage. The raw planning exchange is kept as a
//! [`PlanningRecord`] on the task so replanning can resume the prior
//! conversation instead of starting fresh.

use cadre_abstraction::ModelUsage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One executed tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRecord {
    /// Tool name.
    pub name: String,
    /// Arguments the tool was invoked with.
    pub arguments: Value,
    /// Text of the result (or of the error).
    pub result_text: String,
    /// Whether the call succeeded.
    pub ok: bool,
    /// When the call completed.
    pub at: DateTime<Utc>,
}

/// Append-only record of one agent run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentChain {
    /// The owning agent's name.
    pub agent_name: String,
    /// The task prompt the run started from.
    pub task_prompt: String,
    /// Tool calls in execution order.
    pub records: Vec<ToolRecord>,
    /// Accumulated token usage across every model turn of the run.
    pub usage: ModelUsage,
}

impl AgentChain {
    /// Creates a chain for one agent run.
    pub fn new(agent_name: impl Into<String>, task_prompt: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            task_prompt: task_prompt.into(),
            records: Vec::new(),
            usage: ModelUsage::default(),
        }
    }

    /// Appends a tool call record.
    pub fn push_record(
        &mut self,
        name: impl Into<String>,
        arguments: Value,
        result_text: impl Into<String>,
        ok: bool,
    ) {
        self.records.push(ToolRecord {
            name: name.into(),
            arguments,
            result_text: result_text.into(),
            ok,
            at: Utc::now(),
        });
    }

    /// Accumulates usage from one model turn.
    pub fn add_usage(&mut self, usage: &ModelUsage) {
        self.usage.add(usage);
    }

    /// How many recorded calls failed.
    pub fn error_count(&self) -> usize {
        self.records.iter().filter(|r| !r.ok).count()
    }
}

/// The raw request/response pair of the latest planning exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanningRecord {
    /// The user prompt the plan was generated from.
    pub request: String,
    /// The raw plan document the model produced.
    pub response: String,
}
