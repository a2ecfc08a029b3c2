//! The agent loop.
//!
//! Drives one agent to completion with iterate-observe-act: call the model,
//! turn its output into tool calls, execute them sequentially, fold the
//! results back into the rolling conversation, and decide whether to
//! continue.

pub mod compress;
pub mod fold;

use crate::config::UNFINISHED;
use crate::context::AgentContext;
use crate::error::{CoreError, Result};
use crate::tools::{ListToolsParams, RemoteTool, RemoteToolService, Tool, ToolRegistry, ToolResult};
use cadre_abstraction::{
    LanguageRequest, Message, MessagePart, Role, ToolResultContent, ToolUse,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

pub use fold::{fold_stream, FoldedTurn};

/// A configured agent: identity, prompt, and its static tool set.
pub struct AgentDefinition {
    /// Agent name, referenced by plans and tool listings.
    pub name: String,
    /// What this agent is for; shown to the planner.
    pub description: String,
    /// System prompt for every run of this agent.
    pub system_prompt: String,
    /// Statically configured tools, always available.
    pub tools: Vec<Arc<dyn Tool>>,
}

impl AgentDefinition {
    /// Creates an agent with a generic system prompt.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let name = name.into();
        let system_prompt = format!(
            "You are {}, an autonomous agent. Work on the task you are given, \
             invoking the provided tools when they help. When the task is \
             complete, answer with the final result and no tool calls.",
            name
        );
        Self { name, description: description.into(), system_prompt, tools: Vec::new() }
    }

    /// Overrides the system prompt.
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Adds a static tool.
    #[must_use]
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }
}

/// Observer of a running agent. All methods have no-op defaults.
pub trait AgentObserver: Send + Sync {
    /// Incremental model text.
    fn on_text_delta(&self, _agent: &str, _text: &str) {}
    /// Incremental model reasoning.
    fn on_reasoning_delta(&self, _agent: &str, _text: &str) {}
    /// A tool call is about to execute.
    fn on_tool_call(&self, _agent: &str, _call: &ToolUse) {}
    /// A tool call finished.
    fn on_tool_result(&self, _agent: &str, _tool: &str, _is_error: bool) {}
}

/// An observer that ignores everything.
pub struct NoopObserver;

impl AgentObserver for NoopObserver {}

/// Pluggable decision for when the dynamic tool listing is refreshed.
pub trait ToolRefreshPolicy: Send + Sync {
    /// Whether to refresh before the given iteration.
    fn should_refresh(&self, iteration: u32, ctx: &AgentContext) -> bool;
}

/// Refreshes on the first iteration, and afterwards whenever a watched
/// context variable (by default the agent's current location) changes.
pub struct LocationRefreshPolicy {
    watch_key: String,
    last_seen: Mutex<Option<Value>>,
}

impl LocationRefreshPolicy {
    /// Watches the default "current_location" variable.
    pub fn new() -> Self {
        Self::watching("current_location")
    }

    /// Watches an arbitrary task variable.
    pub fn watching(key: impl Into<String>) -> Self {
        Self { watch_key: key.into(), last_seen: Mutex::new(None) }
    }
}

impl Default for LocationRefreshPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRefreshPolicy for LocationRefreshPolicy {
    fn should_refresh(&self, iteration: u32, ctx: &AgentContext) -> bool {
        let current = ctx.task.get_variable(&self.watch_key);
        let mut last = self.last_seen.lock().expect("last_seen lock");
        let changed = *last != current;
        *last = current;
        iteration == 0 || changed
    }
}

/// Runs one agent's task loop.
pub struct AgentRunner {
    remote_tools: Option<Arc<dyn RemoteToolService>>,
    refresh_policy: Arc<dyn ToolRefreshPolicy>,
    observer: Arc<dyn AgentObserver>,
}

impl Default for AgentRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRunner {
    /// Creates a runner with no remote tool source and a no-op observer.
    pub fn new() -> Self {
        Self {
            remote_tools: None,
            refresh_policy: Arc::new(LocationRefreshPolicy::new()),
            observer: Arc::new(NoopObserver),
        }
    }

    /// Sets the remote tool-listing collaborator.
    #[must_use]
    pub fn with_remote_tools(mut self, remote: Arc<dyn RemoteToolService>) -> Self {
        self.remote_tools = Some(remote);
        self
    }

    /// Sets the tool-refresh policy.
    #[must_use]
    pub fn with_refresh_policy(mut self, policy: Arc<dyn ToolRefreshPolicy>) -> Self {
        self.refresh_policy = policy;
        self
    }

    /// Sets the observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn AgentObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Drives the agent until it converges, exhausts its iteration budget,
    /// is cancelled, or fails too many tools in a row.
    ///
    /// Returns the agent's final text, or the `"Unfinished"` sentinel when
    /// the iteration budget runs out.
    pub async fn run(&self, ctx: &mut AgentContext, task_prompt: &str) -> Result<String> {
        let agent_name = ctx.agent.name.clone();
        let config = ctx.task.config.clone();
        info!(agent = %agent_name, task_id = %ctx.task.task_id, "Starting agent run");

        // The prompt is built once; every later turn extends this history.
        let mut messages = vec![
            Message::system(ctx.agent.system_prompt.clone()),
            Message::user(task_prompt),
        ];

        // Dynamic tool state for the whole run.
        let mut listed_pool: HashMap<String, Arc<dyn Tool>> = HashMap::new();
        let mut latest_listing: Vec<String> = Vec::new();
        let mut used_tools: HashSet<String> = HashSet::new();
        let mut last_error = String::new();

        for iteration in 0..config.max_iterations {
            if ctx.task.cancel.is_cancelled() {
                info!(agent = %agent_name, iteration, "Agent run cancelled");
                return Err(CoreError::Cancelled);
            }

            if let Some(remote) = &self.remote_tools {
                if self.refresh_policy.should_refresh(iteration, ctx) {
                    self.refresh_tools(
                        remote,
                        ctx,
                        task_prompt,
                        &mut listed_pool,
                        &mut latest_listing,
                    )
                    .await;
                }
            }
            let registry =
                resolve_tool_set(&ctx.agent.tools, &listed_pool, &latest_listing, &used_tools);

            compress::bound_attachments(&mut messages);

            let request = LanguageRequest {
                messages: messages.clone(),
                tools: registry.definitions(),
                max_tokens: config.max_tokens,
                temperature: config.temperature,
                cancel: ctx.task.cancel.clone(),
            };
            let stream = ctx.task.llm.call_stream(&request).await?;
            let turn =
                fold_stream(stream, &ctx.task.cancel, self.observer.as_ref(), &agent_name).await?;

            if let Some(usage) = &turn.usage {
                ctx.chain.lock().expect("chain lock").add_usage(usage);
            }

            let calls = dedupe_calls(turn.tool_calls);
            if calls.is_empty() {
                info!(agent = %agent_name, iteration, "Agent converged");
                return Ok(turn.text);
            }

            messages.push(assistant_turn(&turn.text, &calls));

            for call in calls {
                self.observer.on_tool_call(&agent_name, &call);
                used_tools.insert(call.name.clone());

                let result = self.execute_call(&registry, &call, ctx).await;
                self.observer.on_tool_result(&agent_name, &call.name, result.is_error);

                ctx.chain.lock().expect("chain lock").push_record(
                    call.name.clone(),
                    call.arguments.clone(),
                    result.text_content(),
                    !result.is_error,
                );

                if result.is_error {
                    ctx.consecutive_tool_errors += 1;
                    last_error = result.text_content();
                    warn!(
                        agent = %agent_name,
                        tool = %call.name,
                        consecutive = ctx.consecutive_tool_errors,
                        "Tool call failed"
                    );
                    if ctx.consecutive_tool_errors >= config.max_consecutive_tool_errors {
                        return Err(CoreError::ToolFailuresExhausted {
                            agent: agent_name,
                            count: ctx.consecutive_tool_errors,
                            last_error,
                        });
                    }
                } else {
                    ctx.consecutive_tool_errors = 0;
                }

                let needs_image_followup =
                    result.has_image() && !ctx.task.llm.images_in_tool_results();
                messages.push(tool_turn(&call, &result));
                if needs_image_followup {
                    messages.push(image_followup_turn(&call.name, &result));
                }
            }
        }

        info!(agent = %agent_name, "Iteration budget exhausted");
        Ok(UNFINISHED.to_string())
    }

    async fn refresh_tools(
        &self,
        remote: &Arc<dyn RemoteToolService>,
        ctx: &AgentContext,
        task_prompt: &str,
        listed_pool: &mut HashMap<String, Arc<dyn Tool>>,
        latest_listing: &mut Vec<String>,
    ) {
        let params = ListToolsParams {
            task_id: ctx.task.task_id.clone(),
            node_id: ctx.node_id.clone(),
            environment: None,
            agent_name: ctx.agent.name.clone(),
            prompt: Some(task_prompt.to_string()),
            params: None,
        };
        match remote.list_tools(&params).await {
            Ok(definitions) => {
                latest_listing.clear();
                for definition in definitions {
                    latest_listing.push(definition.name.clone());
                    listed_pool.insert(
                        definition.name.clone(),
                        Arc::new(RemoteTool::new(definition, Arc::clone(remote))),
                    );
                }
                debug!(
                    agent = %ctx.agent.name,
                    listed = latest_listing.len(),
                    "Refreshed dynamic tool listing"
                );
            }
            Err(e) => {
                // A failed listing leaves the previous tool set in place.
                warn!(agent = %ctx.agent.name, error = %e, "Tool listing failed");
            }
        }
    }

    async fn execute_call(
        &self,
        registry: &ToolRegistry,
        call: &ToolUse,
        ctx: &mut AgentContext,
    ) -> ToolResult {
        let Some(tool) = registry.get(&call.name).map(Arc::clone) else {
            return ToolResult::error(format!("Error: tool '{}' not found", call.name));
        };
        match tool.execute(call.arguments.clone(), ctx).await {
            Ok(result) => result,
            Err(e) => ToolResult::error(format!("Error: {}", e)),
        }
    }
}

/// Resolves the tool set for one turn: static tools, plus the latest
/// listing, plus any previously-listed tool that has already been used.
/// Once used, a tool stays resolvable even if a later listing omits it.
fn resolve_tool_set(
    static_tools: &[Arc<dyn Tool>],
    listed_pool: &HashMap<String, Arc<dyn Tool>>,
    latest_listing: &[String],
    used_tools: &HashSet<String>,
) -> ToolRegistry {
    let mut registry = ToolRegistry::from_tools(static_tools.iter().cloned());
    for name in latest_listing {
        if let Some(tool) = listed_pool.get(name) {
            registry.insert(Arc::clone(tool));
        }
    }
    for name in used_tools {
        if !registry.contains(name) {
            if let Some(tool) = listed_pool.get(name) {
                registry.insert(Arc::clone(tool));
            }
        }
    }
    registry
}

/// Collapses tool calls sharing identical (name, serialized arguments),
/// keeping the first occurrence.
fn dedupe_calls(calls: Vec<ToolUse>) -> Vec<ToolUse> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(calls.len());
    for call in calls {
        if seen.insert((call.name.clone(), call.arguments_key())) {
            out.push(call);
        } else {
            debug!(tool = %call.name, "Dropping duplicate tool call");
        }
    }
    out
}

fn assistant_turn(text: &str, calls: &[ToolUse]) -> Message {
    let mut parts = Vec::new();
    if !text.is_empty() {
        parts.push(MessagePart::text(text));
    }
    for call in calls {
        parts.push(MessagePart::ToolCall {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        });
    }
    Message { role: Role::Assistant, parts }
}

fn tool_turn(call: &ToolUse, result: &ToolResult) -> Message {
    Message {
        role: Role::Tool,
        parts: vec![MessagePart::ToolResult {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            content: result.content.clone(),
            is_error: result.is_error,
        }],
    }
}

/// Synthetic user turn carrying an image result, for backends that cannot
/// consume images through the tool role.
fn image_followup_turn(tool_name: &str, result: &ToolResult) -> Message {
    let mut parts =
        vec![MessagePart::text(format!("Image produced by the '{}' tool:", tool_name))];
    for block in &result.content {
        if let ToolResultContent::Image { data, mime_type } = block {
            parts.push(MessagePart::Image { data: data.clone(), mime_type: mime_type.clone() });
        }
    }
    Message { role: Role::User, parts }
}
