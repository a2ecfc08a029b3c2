//! Remote tool-listing collaborator.
//!
//! An external service can list and execute additional tools on demand.
//! Only the interface lives here: implementations may be backed by a
//! persistent push channel with periodic keep-alive and reconnect-on-error,
//! but the engine sees `connect`/`list_tools`/`call_tool`/`close` and
//! nothing else.

use crate::tools::{Tool, ToolResult};
use crate::context::AgentContext;
use async_trait::async_trait;
use cadre_abstraction::ToolDefinition;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Parameters for a tool-listing request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListToolsParams {
    /// The task the listing is for.
    #[serde(rename = "taskId")]
    pub task_id: String,
    /// The workflow node being executed, if any.
    #[serde(rename = "nodeId", skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Execution environment hint (e.g., "browser", "desktop").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    /// The requesting agent's name.
    pub agent_name: String,
    /// The current task prompt, for relevance filtering on the far side.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Free-form parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// External service that can list and execute tools on demand.
#[async_trait]
pub trait RemoteToolService: Send + Sync {
    /// Establishes the connection.
    async fn connect(&self) -> anyhow::Result<()>;

    /// Whether the connection is currently usable.
    fn is_connected(&self) -> bool;

    /// Lists tools relevant to the given request.
    async fn list_tools(&self, params: &ListToolsParams) -> anyhow::Result<Vec<ToolDefinition>>;

    /// Executes a listed tool by name.
    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        ext_info: Option<Value>,
    ) -> anyhow::Result<ToolResult>;

    /// Tears the connection down.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Adapts one remotely-listed tool schema into the [`Tool`] trait.
pub struct RemoteTool {
    definition: ToolDefinition,
    service: Arc<dyn RemoteToolService>,
}

impl RemoteTool {
    /// Wraps a listed definition.
    pub fn new(definition: ToolDefinition, service: Arc<dyn RemoteToolService>) -> Self {
        Self { definition, service }
    }
}

#[async_trait]
impl Tool for RemoteTool {
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn description(&self) -> &str {
        &self.definition.description
    }

    fn parameters(&self) -> Value {
        self.definition.parameters.clone()
    }

    async fn execute(&self, args: Value, _ctx: &mut AgentContext) -> anyhow::Result<ToolResult> {
        debug!(tool = %self.definition.name, "Dispatching remote tool call");
        self.service.call_tool(&self.definition.name, args, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_tools_params_wire_names() {
        let params = ListToolsParams {
            task_id: "t1".to_string(),
            node_id: Some("n1".to_string()),
            environment: None,
            agent_name: "browser".to_string(),
            prompt: None,
            params: None,
        };
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["taskId"], "t1");
        assert_eq!(json["nodeId"], "n1");
        assert_eq!(json["agent_name"], "browser");
        assert!(json.get("environment").is_none());
    }
}
