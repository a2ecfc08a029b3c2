//! Model abstraction layer for Cadre.
//!
//! This crate defines the core traits and types for interacting with language
//! models: the conversation data model, tool definitions, the streaming event
//! union, and the [`LanguageModel`] trait that every provider implements.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod message;
pub mod stream;

pub use message::{
    LanguageRequest, Message, MessagePart, Role, ToolDefinition, ToolResultContent, ToolUse,
};
pub use stream::{EventStream, StreamEvent};

/// Represents an error that can occur when interacting with a language model.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelError {
    /// An error occurred during the API request (e.g., network issues, invalid request).
    #[error("Request Error: {0}")]
    RequestError(String),

    /// The model returned an error (e.g., invalid input, malformed completion).
    #[error("Model Response Error: {0}")]
    ModelResponseError(String),

    /// An error occurred during serialization or deserialization.
    #[error("Serialization Error: {0}")]
    SerializationError(String),

    /// The model provider is not supported or configured.
    #[error("Unsupported Model Provider: {0}")]
    UnsupportedProvider(String),

    /// Provider quota exceeded or rate limit hit (hard stop error).
    #[error("Provider '{provider}' quota exceeded")]
    QuotaExceeded {
        /// The provider name (e.g., "openai", "anthropic").
        provider: String,
        /// Optional error message from the provider.
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// A backend accepted the connection but produced no output in time.
    #[error("Timed out waiting for model output from '{0}'")]
    Timeout(String),

    /// The request was cancelled cooperatively.
    #[error("Model request cancelled")]
    Cancelled,

    /// Every configured backend failed or timed out. Terminal for the call.
    #[error("No configured model backend is available: {0}")]
    Unavailable(String),
}

/// Usage statistics for a model request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUsage {
    /// Number of tokens in the prompt.
    pub prompt_tokens: u32,

    /// Number of tokens in the completion.
    pub completion_tokens: u32,

    /// Total number of tokens used.
    pub total_tokens: u32,
}

impl ModelUsage {
    /// Accumulates another usage record into this one.
    pub fn add(&mut self, other: &ModelUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Why a completion stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The model finished its turn naturally.
    Stop,
    /// The model stopped to invoke one or more tools.
    ToolUse,
    /// The completion hit the max token limit.
    Length,
    /// The provider reported some other stop condition.
    Other,
}

/// The completed (non-streaming) response from a language model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageResponse {
    /// Generated text, if any.
    pub text: String,

    /// Accumulated reasoning/thinking text, if the model exposes it.
    pub thinking: Option<String>,

    /// Tool invocations requested by the model, in emission order.
    pub tool_calls: Vec<ToolUse>,

    /// Why the completion stopped.
    pub finish_reason: FinishReason,

    /// Usage statistics for the request, when reported.
    pub usage: Option<ModelUsage>,
}

impl LanguageResponse {
    /// A plain text response with no tool calls.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            thinking: None,
            tool_calls: Vec::new(),
            finish_reason: FinishReason::Stop,
            usage: None,
        }
    }
}

/// A trait for interacting with different language model backends.
///
/// All models must be `Send + Sync` to allow concurrent use across tasks.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Generates a completion for the given request.
    ///
    /// # Errors
    /// Returns a `ModelError` if generation fails.
    async fn call(&self, request: &LanguageRequest) -> Result<LanguageResponse, ModelError>;

    /// Generates a completion as a lazily-pulled event stream.
    ///
    /// The returned stream is forward-only and non-restartable: events are
    /// produced as the backend emits them and cannot be replayed.
    ///
    /// # Errors
    /// Returns a `ModelError` if the stream cannot be established.
    async fn call_stream(&self, request: &LanguageRequest) -> Result<EventStream, ModelError>;

    /// Returns the ID of the underlying model.
    fn model_id(&self) -> &str;

    /// Whether this backend accepts image content inside a tool-result part.
    ///
    /// Providers that reject images in the tool role force the caller to
    /// re-send the image in a follow-up user turn.
    fn images_in_tool_results(&self) -> bool {
        false
    }
}
