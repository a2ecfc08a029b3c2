//! Conversation data model shared by every provider.
//!
//! A [`Message`] is an ordered list of [`MessagePart`]s under one [`Role`].
//! Tool invocations and their results travel through the same structure so
//! that a rolling conversation can be replayed verbatim against any backend.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// The role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// End-user (or synthetic user) input.
    User,
    /// Model output.
    Assistant,
    /// Tool execution results.
    Tool,
}

/// One tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolUse {
    /// Provider-assigned call id, used to correlate the result.
    pub id: String,
    /// Name of the tool to invoke.
    pub name: String,
    /// Arguments as a JSON value matching the tool's parameter schema.
    pub arguments: Value,
}

impl ToolUse {
    /// Canonical serialized form of the arguments, used for de-duplication.
    pub fn arguments_key(&self) -> String {
        serde_json::to_string(&self.arguments).unwrap_or_default()
    }
}

/// A block of content inside a tool result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolResultContent {
    /// Plain text output.
    Text {
        /// The text payload.
        text: String,
    },
    /// An image, base64-encoded.
    Image {
        /// Base64 payload.
        data: String,
        /// MIME type (e.g., "image/png").
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

/// One part of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MessagePart {
    /// Plain text.
    Text {
        /// The text payload.
        text: String,
    },
    /// An inline image, base64-encoded.
    Image {
        /// Base64 payload.
        data: String,
        /// MIME type.
        mime_type: String,
    },
    /// An inline file attachment, base64-encoded.
    File {
        /// Base64 payload.
        data: String,
        /// MIME type.
        mime_type: String,
    },
    /// A tool invocation emitted by the assistant.
    ToolCall {
        /// Provider-assigned call id.
        id: String,
        /// Tool name.
        name: String,
        /// Arguments as JSON.
        arguments: Value,
    },
    /// The result of a tool invocation, sent back under [`Role::Tool`].
    ToolResult {
        /// The call id this result answers.
        tool_call_id: String,
        /// Name of the tool that produced the result.
        name: String,
        /// Result content blocks.
        content: Vec<ToolResultContent>,
        /// Whether the tool reported failure.
        is_error: bool,
    },
}

impl MessagePart {
    /// Shorthand for a text part.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The role of the sender.
    pub role: Role,
    /// Ordered content parts.
    pub parts: Vec<MessagePart>,
}

impl Message {
    /// Creates a system message from plain text.
    pub fn system(text: impl Into<String>) -> Self {
        Self { role: Role::System, parts: vec![MessagePart::text(text)] }
    }

    /// Creates a user message from plain text.
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, parts: vec![MessagePart::text(text)] }
    }

    /// Creates an assistant message from plain text.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, parts: vec![MessagePart::text(text)] }
    }

    /// Concatenated text of every text part.
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let MessagePart::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }
}

/// The JSON-schema contract for one tool exposed to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name.
    pub name: String,
    /// Human-readable description shown to the model.
    pub description: String,
    /// JSON schema for the arguments object.
    pub parameters: Value,
}

/// A complete request to a language model.
#[derive(Debug, Clone)]
pub struct LanguageRequest {
    /// Ordered conversation turns.
    pub messages: Vec<Message>,
    /// Tools the model may invoke this turn.
    pub tools: Vec<ToolDefinition>,
    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Cooperative cancellation signal, checked at stream-read boundaries.
    pub cancel: CancellationToken,
}

impl LanguageRequest {
    /// Creates a request with the given messages and no tools.
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            max_tokens: None,
            temperature: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the available tools.
    #[must_use]
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}
