//! Model implementations for Cadre.
//!
//! This crate provides concrete implementations of the `LanguageModel` trait.
//!
//! # Supported Providers
//!
//! - **Mock**: Testing and development (scripted responses)
//! - **Anthropic**: Claude models via the Messages API (API key required)
//! - **OpenAI-compatible**: OpenAI, vLLM, LocalAI, LM Studio, Ollama's
//!   OpenAI endpoint, and anything else speaking `/chat/completions`
//!
//! The [`RetryLanguageModel`] wraps any number of configured backends behind
//! a single call/stream API with ordered failover.

pub mod claude;
pub mod factory;
pub mod openai;
pub mod retry;
mod sse;

use async_trait::async_trait;
use cadre_abstraction::{
    EventStream, FinishReason, LanguageModel, LanguageRequest, LanguageResponse, ModelError,
    ModelUsage, StreamEvent,
};
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::debug;

pub use claude::ClaudeProvider;
pub use factory::{ProviderConfig, ProviderFactory, ProviderKind};
pub use openai::OpenAiProvider;
pub use retry::{RetryConfig, RetryLanguageModel};

/// A mock implementation of the `LanguageModel` trait for testing.
///
/// Responses are scripted: each call pops the next queued response. An empty
/// queue echoes the last user message. `call_stream` replays a scripted
/// response as text deltas followed by tool calls and a finish event.
#[derive(Debug, Default)]
pub struct MockProvider {
    id: String,
    script: Mutex<VecDeque<Result<LanguageResponse, ModelError>>>,
}

impl MockProvider {
    /// Creates a new `MockProvider` with the given ID and an empty script.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), script: Mutex::new(VecDeque::new()) }
    }

    /// Queues a response to be returned by the next call.
    pub fn push_response(&self, response: LanguageResponse) {
        self.script.lock().expect("script lock").push_back(Ok(response));
    }

    /// Queues an error to be returned by the next call.
    pub fn push_error(&self, error: ModelError) {
        self.script.lock().expect("script lock").push_back(Err(error));
    }

    fn next_scripted(&self, request: &LanguageRequest) -> Result<LanguageResponse, ModelError> {
        let scripted = self.script.lock().expect("script lock").pop_front();
        scripted.unwrap_or_else(|| {
            let echo = request
                .messages
                .iter()
                .rev()
                .find(|m| m.role == cadre_abstraction::Role::User)
                .map(cadre_abstraction::Message::text_content)
                .unwrap_or_default();
            Ok(LanguageResponse::text(format!("Mock response to: {}", echo)))
        })
    }
}

#[async_trait]
impl LanguageModel for MockProvider {
    async fn call(&self, request: &LanguageRequest) -> Result<LanguageResponse, ModelError> {
        debug!(model_id = %self.id, messages = request.messages.len(), "MockProvider call");
        self.next_scripted(request)
    }

    async fn call_stream(&self, request: &LanguageRequest) -> Result<EventStream, ModelError> {
        debug!(model_id = %self.id, messages = request.messages.len(), "MockProvider call_stream");
        let response = self.next_scripted(request)?;

        let mut events: Vec<Result<StreamEvent, ModelError>> = Vec::new();
        if let Some(thinking) = &response.thinking {
            events.push(Ok(StreamEvent::ReasoningDelta { text: thinking.clone() }));
        }
        // Split text into two deltas so consumers exercise accumulation.
        let text = response.text;
        if !text.is_empty() {
            let mid = text.len() / 2;
            let mid = (0..=mid).rev().find(|i| text.is_char_boundary(*i)).unwrap_or(0);
            events.push(Ok(StreamEvent::TextDelta { text: text[..mid].to_string() }));
            events.push(Ok(StreamEvent::TextDelta { text: text[mid..].to_string() }));
        }
        for call in &response.tool_calls {
            events.push(Ok(StreamEvent::ToolCall {
                id: call.id.clone(),
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            }));
        }
        let reason = if response.tool_calls.is_empty() {
            response.finish_reason
        } else {
            FinishReason::ToolUse
        };
        events.push(Ok(StreamEvent::Finish { reason, usage: response.usage }));

        Ok(Box::pin(futures::stream::iter(events)))
    }

    fn model_id(&self) -> &str {
        &self.id
    }

    fn images_in_tool_results(&self) -> bool {
        true
    }
}

/// Accumulates a finished [`LanguageResponse`] by draining an event stream.
///
/// For callers that take the streaming path but still want the folded
/// response at the end.
pub async fn collect_stream(mut stream: EventStream) -> Result<LanguageResponse, ModelError> {
    use futures::StreamExt;

    let mut text = String::new();
    let mut thinking = String::new();
    let mut tool_calls = Vec::new();
    let mut finish_reason = FinishReason::Stop;
    let mut usage: Option<ModelUsage> = None;

    while let Some(event) = stream.next().await {
        match event? {
            StreamEvent::TextDelta { text: t } => text.push_str(&t),
            StreamEvent::ReasoningDelta { text: t } => thinking.push_str(&t),
            StreamEvent::ToolCall { id, name, arguments } => {
                tool_calls.push(cadre_abstraction::ToolUse { id, name, arguments });
            }
            StreamEvent::ToolCallDelta { .. } | StreamEvent::File { .. } => {}
            StreamEvent::Error { message } => {
                return Err(ModelError::ModelResponseError(message));
            }
            StreamEvent::Finish { reason, usage: u } => {
                finish_reason = reason;
                usage = u;
            }
        }
    }

    Ok(LanguageResponse {
        text,
        thinking: if thinking.is_empty() { None } else { Some(thinking) },
        tool_calls,
        finish_reason,
        usage,
    })
}
