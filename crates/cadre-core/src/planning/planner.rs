//! The planner.
//!
//! Prompts a model for a constrained plan document and parses it
//! incrementally while it streams: each text delta triggers a best-effort
//! re-parse of the accumulated output, reported to an observer with a
//! "not done" flag. Only the parse after stream completion can fail.

use crate::context::TaskContext;
use crate::chain::PlanningRecord;
use crate::error::{CoreError, Result};
use crate::planning::parser;
use crate::planning::Workflow;
use crate::agent::AgentDefinition;
use cadre_abstraction::{LanguageRequest, Message, ModelError, StreamEvent};
use futures::StreamExt;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info};

/// Observer of streaming plan construction.
pub trait PlanObserver: Send + Sync {
    /// A parseable snapshot of the plan. `done` is true exactly once, for
    /// the final parse after the stream completes.
    fn on_plan(&self, _workflow: &Workflow, _done: bool) {}
}

/// An observer that ignores everything.
pub struct NoopPlanObserver;

impl PlanObserver for NoopPlanObserver {}

/// Converts free-form task prompts into [`Workflow`]s.
#[derive(Default)]
pub struct Planner;

impl Planner {
    /// Creates a planner.
    pub fn new() -> Self {
        Self
    }

    /// Plans a workflow for the given prompt.
    pub async fn plan(
        &self,
        task: &TaskContext,
        prompt: &str,
        observer: &dyn PlanObserver,
    ) -> Result<Workflow> {
        let messages = vec![
            Message::system(build_planning_prompt(&task.agents)),
            Message::user(prompt),
        ];
        self.run_planning(task, messages, prompt, observer).await
    }

    /// Replans with a new instruction, reusing the prior planning exchange
    /// as conversation history so earlier reasoning is preserved.
    pub async fn replan(
        &self,
        task: &TaskContext,
        instruction: &str,
        observer: &dyn PlanObserver,
    ) -> Result<Workflow> {
        let Some(record) = task.planning_record() else {
            debug!(task_id = %task.task_id, "No prior plan; planning from scratch");
            return self.plan(task, instruction, observer).await;
        };

        let messages = vec![
            Message::system(build_planning_prompt(&task.agents)),
            Message::user(record.request.clone()),
            Message::assistant(record.response.clone()),
            Message::user(instruction),
        ];
        self.run_planning(task, messages, instruction, observer).await
    }

    async fn run_planning(
        &self,
        task: &TaskContext,
        messages: Vec<Message>,
        request_text: &str,
        observer: &dyn PlanObserver,
    ) -> Result<Workflow> {
        let request = LanguageRequest {
            messages,
            tools: Vec::new(),
            max_tokens: task.config.max_tokens,
            temperature: task.config.temperature,
            cancel: task.cancel.clone(),
        };
        let mut stream = task.llm.call_stream(&request).await?;

        let mut raw = String::new();
        loop {
            if task.cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            let event = tokio::select! {
                () = task.cancel.cancelled() => return Err(CoreError::Cancelled),
                event = stream.next() => event,
            };
            let Some(event) = event else {
                break;
            };
            match event? {
                StreamEvent::TextDelta { text } => {
                    raw.push_str(&text);
                    // A failure here just means "not yet parseable".
                    if let Some(partial) = parser::parse_prefix(&raw) {
                        observer.on_plan(&partial, false);
                    }
                }
                StreamEvent::Error { message } => {
                    return Err(CoreError::Model(ModelError::ModelResponseError(message)));
                }
                // Planning ignores reasoning and tool traffic.
                _ => {}
            }
        }

        let workflow = parser::parse_final(&raw)?;
        info!(
            task_id = %task.task_id,
            plan = %workflow.name,
            agents = workflow.agents.len(),
            "Plan complete"
        );
        observer.on_plan(&workflow, true);

        task.set_planning_record(PlanningRecord {
            request: request_text.to_string(),
            response: raw,
        });
        task.set_workflow(workflow.clone());
        Ok(workflow)
    }
}

/// Builds the planning system prompt, including the agent roster.
fn build_planning_prompt(agents: &[Arc<AgentDefinition>]) -> String {
    let mut prompt = String::from(
        "You convert a user's task into an execution plan for the agents \
         listed below. Respond with ONLY an XML document in exactly this \
         format, no prose before or after:\n\n\
         <root>\n\
         \x20 <name>short plan name</name>\n\
         \x20 <thought>your reasoning</thought>\n\
         \x20 <agents>\n\
         \x20   <agent name=\"AgentName\" dependsOn=\"OtherAgent\">\n\
         \x20     <task>what this agent must accomplish</task>\n\
         \x20     <nodes>\n\
         \x20       <node>a concrete step</node>\n\
         \x20       <node input=\"key\" output=\"key\">a step reading and writing shared values</node>\n\
         \x20       <forEach items=\"collection\"><node>a step applied to each item</node></forEach>\n\
         \x20       <watch event=\"dom\" loop=\"true\">\n\
         \x20         <description>what to watch</description>\n\
         \x20         <trigger><node>a step to run when it fires</node></trigger>\n\
         \x20       </watch>\n\
         \x20     </nodes>\n\
         \x20   </agent>\n\
         \x20 </agents>\n\
         </root>\n\n\
         dependsOn is optional: a comma-separated list of agent names whose \
         results this agent needs. Omit it when document order is enough.\n\n\
         Available agents:\n",
    );
    for agent in agents {
        let _ = writeln!(prompt, "- {}: {}", agent.name, agent.description);
    }
    prompt.push_str("\nUse only these agents.");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_planning_prompt_lists_agents() {
        let agents = vec![
            Arc::new(AgentDefinition::new("Browser", "drives a web browser")),
            Arc::new(AgentDefinition::new("Files", "reads and writes files")),
        ];
        let prompt = build_planning_prompt(&agents);
        assert!(prompt.contains("- Browser: drives a web browser"));
        assert!(prompt.contains("- Files: reads and writes files"));
        assert!(prompt.contains("<forEach items="));
    }
}
