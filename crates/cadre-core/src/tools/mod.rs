//! Tool contract and dispatch.
//!
//! A [`Tool`] is a named, schema-described capability an agent may invoke.
//! Tools are explicit trait implementations, never shape-checked objects;
//! the registry resolves a model-chosen name to an executable handler.

pub mod remote;

use crate::context::AgentContext;
use async_trait::async_trait;
use cadre_abstraction::{ToolDefinition, ToolResultContent};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub use remote::{ListToolsParams, RemoteTool, RemoteToolService};

/// The result of one tool execution.
#[derive(Debug, Clone)]
pub struct ToolResult {
    /// Result content blocks (text and/or images).
    pub content: Vec<ToolResultContent>,
    /// Whether the tool reported failure.
    pub is_error: bool,
    /// Opaque passthrough data for external collaborators.
    pub ext_info: Option<Value>,
}

impl ToolResult {
    /// A successful text result.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolResultContent::Text { text: text.into() }],
            is_error: false,
            ext_info: None,
        }
    }

    /// An error result. Error texts conventionally begin with "Error".
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolResultContent::Text { text: text.into() }],
            is_error: true,
            ext_info: None,
        }
    }

    /// A successful image result.
    pub fn image(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            content: vec![ToolResultContent::Image {
                data: data.into(),
                mime_type: mime_type.into(),
            }],
            is_error: false,
            ext_info: None,
        }
    }

    /// Appends a text block.
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.content.push(ToolResultContent::Text { text: text.into() });
        self
    }

    /// Concatenated text of every text block.
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let ToolResultContent::Text { text } = block {
                out.push_str(text);
            }
        }
        out
    }

    /// Whether any block is an image.
    pub fn has_image(&self) -> bool {
        self.content.iter().any(|c| matches!(c, ToolResultContent::Image { .. }))
    }
}

/// A named, schema-described capability an agent may invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name as exposed to the model.
    fn name(&self) -> &str;

    /// Human-readable description shown to the model.
    fn description(&self) -> &str;

    /// JSON schema for the arguments object.
    fn parameters(&self) -> Value;

    /// Executes the tool. Arbitrary failures are fine; the agent loop
    /// converts them into error-flagged results fed back to the model.
    async fn execute(&self, args: Value, ctx: &mut AgentContext) -> anyhow::Result<ToolResult>;

    /// The wire-level definition advertised to the model.
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

/// Resolves tool names to handlers, preserving insertion order for the
/// definitions advertised to the model.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry from the given tools.
    pub fn from_tools(tools: impl IntoIterator<Item = Arc<dyn Tool>>) -> Self {
        let mut registry = Self::new();
        for tool in tools {
            registry.insert(tool);
        }
        registry
    }

    /// Inserts a tool, replacing any existing tool of the same name in
    /// place (the original position is kept).
    pub fn insert(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if let Some(&i) = self.index.get(&name) {
            self.tools[i] = tool;
        } else {
            self.index.insert(name, self.tools.len());
            self.tools.push(tool);
        }
    }

    /// Resolves a tool by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    /// Whether a tool of this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions for every registered tool, in insertion order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }
}
