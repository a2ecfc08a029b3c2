//! Claude (Anthropic) provider implementation.
//!
//! Implements the `LanguageModel` trait over Anthropic's Messages API.
//!
//! Claude uses a dedicated `system` field for system messages: system turns
//! are extracted from the message array and concatenated into that field
//! rather than travelling inline. Tool results are sent back as
//! `tool_result` content blocks inside a user turn, which also means this
//! backend accepts images inside tool results.

use crate::sse::SseDataStream;
use async_trait::async_trait;
use cadre_abstraction::{
    EventStream, FinishReason, LanguageModel, LanguageRequest, LanguageResponse, Message,
    MessagePart, ModelError, ModelUsage, Role, StreamEvent, ToolResultContent, ToolUse,
};
use futures::Stream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{debug, error, warn};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Claude provider implementation.
#[derive(Debug, Clone)]
pub struct ClaudeProvider {
    /// The model ID (e.g., "claude-sonnet-4-5").
    model_id: String,
    /// The API key for authentication.
    api_key: String,
    /// The base URL for the Claude API.
    base_url: String,
    /// HTTP client for making requests.
    client: Client,
}

impl ClaudeProvider {
    /// Creates a new `ClaudeProvider` with the given model ID and API key.
    #[must_use]
    pub fn new(model_id: String, api_key: String) -> Self {
        Self {
            model_id,
            api_key,
            base_url: "https://api.anthropic.com/v1".to_string(),
            client: Client::new(),
        }
    }

    /// Overrides the API base URL (proxies, test servers).
    #[must_use]
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    /// Extracts system messages into the dedicated `system` field.
    ///
    /// Multiple system messages are concatenated with a blank line.
    fn extract_system(messages: &[Message]) -> Option<String> {
        let parts: Vec<String> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(Message::text_content)
            .collect();
        if parts.is_empty() { None } else { Some(parts.join("\n\n")) }
    }

    /// Converts non-system messages into Claude wire messages.
    ///
    /// Tool-role turns become user turns carrying `tool_result` blocks.
    fn to_wire_messages(messages: &[Message]) -> Vec<WireMessage> {
        messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|msg| {
                let role = match msg.role {
                    Role::Assistant => "assistant",
                    _ => "user",
                };
                let content: Vec<Value> = msg.parts.iter().map(Self::part_to_block).collect();
                WireMessage { role: role.to_string(), content }
            })
            .collect()
    }

    fn part_to_block(part: &MessagePart) -> Value {
        match part {
            MessagePart::Text { text } => json!({"type": "text", "text": text}),
            MessagePart::Image { data, mime_type } => json!({
                "type": "image",
                "source": {"type": "base64", "media_type": mime_type, "data": data},
            }),
            MessagePart::File { data, mime_type } => json!({
                "type": "document",
                "source": {"type": "base64", "media_type": mime_type, "data": data},
            }),
            MessagePart::ToolCall { id, name, arguments } => json!({
                "type": "tool_use", "id": id, "name": name, "input": arguments,
            }),
            MessagePart::ToolResult { tool_call_id, content, is_error, .. } => {
                let blocks: Vec<Value> = content
                    .iter()
                    .map(|c| match c {
                        ToolResultContent::Text { text } => json!({"type": "text", "text": text}),
                        ToolResultContent::Image { data, mime_type } => json!({
                            "type": "image",
                            "source": {"type": "base64", "media_type": mime_type, "data": data},
                        }),
                    })
                    .collect();
                json!({
                    "type": "tool_result",
                    "tool_use_id": tool_call_id,
                    "content": blocks,
                    "is_error": is_error,
                })
            }
        }
    }

    fn build_body(&self, request: &LanguageRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": self.model_id,
            "messages": Self::to_wire_messages(&request.messages),
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });
        if let Some(system) = Self::extract_system(&request.messages) {
            body["system"] = json!(system);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, ModelError> {
        let url = format!("{}/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to send request to Claude API");
                ModelError::RequestError(format!("Network error: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            error!(status = %status, error = %error_text, "Claude API returned error status");

            if status == 402 || status == 429 || is_quota_error(&error_text) {
                return Err(ModelError::QuotaExceeded {
                    provider: "anthropic".to_string(),
                    message: Some(error_text),
                });
            }
            return Err(ModelError::ModelResponseError(format!(
                "API error ({}): {}",
                status, error_text
            )));
        }
        Ok(response)
    }
}

/// Checks an Anthropic error body for quota/rate-limit error types.
fn is_quota_error(error_text: &str) -> bool {
    if let Ok(error_json) = serde_json::from_str::<Value>(error_text) {
        let error_type = error_json
            .get("error")
            .and_then(|e| e.get("type"))
            .or_else(|| error_json.get("type"))
            .and_then(Value::as_str);
        if let Some(error_type) = error_type {
            return matches!(
                error_type,
                "rate_limit_error" | "overloaded_error" | "insufficient_quota"
            );
        }
    }
    let lower = error_text.to_lowercase();
    lower.contains("quota") || lower.contains("rate limit")
}

fn map_stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("end_turn" | "stop_sequence") | None => FinishReason::Stop,
        Some("tool_use") => FinishReason::ToolUse,
        Some("max_tokens") => FinishReason::Length,
        Some(_) => FinishReason::Other,
    }
}

#[async_trait]
impl LanguageModel for ClaudeProvider {
    async fn call(&self, request: &LanguageRequest) -> Result<LanguageResponse, ModelError> {
        debug!(
            model_id = %self.model_id,
            message_count = request.messages.len(),
            tool_count = request.tools.len(),
            "ClaudeProvider generating completion"
        );

        let body = self.build_body(request, false);
        let response = self.send(&body).await?;

        let claude_response: ClaudeResponse = response.json().await.map_err(|e| {
            error!(error = %e, "Failed to parse Claude API response");
            ModelError::SerializationError(format!("Failed to parse response: {}", e))
        })?;

        let mut text = String::new();
        let mut thinking = String::new();
        let mut tool_calls = Vec::new();
        for block in claude_response.content {
            match block {
                ClaudeContent::Text { text: t } => text.push_str(&t),
                ClaudeContent::Thinking { thinking: t } => thinking.push_str(&t),
                ClaudeContent::ToolUse { id, name, input } => {
                    tool_calls.push(ToolUse { id, name, arguments: input });
                }
                ClaudeContent::Other => {}
            }
        }

        let usage = claude_response.usage.map(|u| ModelUsage {
            prompt_tokens: u.input_tokens,
            completion_tokens: u.output_tokens,
            total_tokens: u.input_tokens + u.output_tokens,
        });

        Ok(LanguageResponse {
            text,
            thinking: if thinking.is_empty() { None } else { Some(thinking) },
            tool_calls,
            finish_reason: map_stop_reason(claude_response.stop_reason.as_deref()),
            usage,
        })
    }

    async fn call_stream(&self, request: &LanguageRequest) -> Result<EventStream, ModelError> {
        debug!(
            model_id = %self.model_id,
            message_count = request.messages.len(),
            "ClaudeProvider generating streaming completion"
        );

        let body = self.build_body(request, true);
        let response = self.send(&body).await?;

        Ok(Box::pin(ClaudeEventStream::new(Box::pin(SseDataStream::new(response)))))
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn images_in_tool_results(&self) -> bool {
        true
    }
}

/// What kind of content block the stream currently has open at an index.
enum OpenBlock {
    Text,
    Thinking,
    ToolUse { id: String, name: String, json_buf: String },
}

/// Folds Anthropic SSE payloads into the provider-neutral event union.
struct ClaudeEventStream {
    inner: Pin<Box<dyn Stream<Item = Result<String, ModelError>> + Send>>,
    blocks: HashMap<u64, OpenBlock>,
    pending: VecDeque<StreamEvent>,
    input_tokens: u32,
    output_tokens: u32,
    stop_reason: Option<String>,
    done: bool,
}

impl ClaudeEventStream {
    fn new(inner: Pin<Box<dyn Stream<Item = Result<String, ModelError>> + Send>>) -> Self {
        Self {
            inner,
            blocks: HashMap::new(),
            pending: VecDeque::new(),
            input_tokens: 0,
            output_tokens: 0,
            stop_reason: None,
            done: false,
        }
    }

    /// Interprets one SSE data payload, queueing resulting events.
    fn handle_payload(&mut self, data: &str) {
        let payload: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                // Some proxies inject empty keep-alive payloads.
                debug!("Skipping unparseable SSE payload: {}", e);
                return;
            }
        };

        match payload.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                if let Some(tokens) = payload
                    .pointer("/message/usage/input_tokens")
                    .and_then(Value::as_u64)
                {
                    self.input_tokens = tokens as u32;
                }
            }
            Some("content_block_start") => {
                let index = payload.get("index").and_then(Value::as_u64).unwrap_or(0);
                let block = payload.get("content_block").cloned().unwrap_or_default();
                let open = match block.get("type").and_then(Value::as_str) {
                    Some("tool_use") => OpenBlock::ToolUse {
                        id: block.get("id").and_then(Value::as_str).unwrap_or("").to_string(),
                        name: block.get("name").and_then(Value::as_str).unwrap_or("").to_string(),
                        json_buf: String::new(),
                    },
                    Some("thinking") => OpenBlock::Thinking,
                    _ => OpenBlock::Text,
                };
                self.blocks.insert(index, open);
            }
            Some("content_block_delta") => {
                let index = payload.get("index").and_then(Value::as_u64).unwrap_or(0);
                let delta = payload.get("delta").cloned().unwrap_or_default();
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        if let Some(text) = delta.get("text").and_then(Value::as_str) {
                            self.pending
                                .push_back(StreamEvent::TextDelta { text: text.to_string() });
                        }
                    }
                    Some("thinking_delta") => {
                        if let Some(text) = delta.get("thinking").and_then(Value::as_str) {
                            self.pending
                                .push_back(StreamEvent::ReasoningDelta { text: text.to_string() });
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(fragment) = delta.get("partial_json").and_then(Value::as_str) {
                            if let Some(OpenBlock::ToolUse { id, name, json_buf }) =
                                self.blocks.get_mut(&index)
                            {
                                json_buf.push_str(fragment);
                                self.pending.push_back(StreamEvent::ToolCallDelta {
                                    id: id.clone(),
                                    name: name.clone(),
                                    arguments_delta: fragment.to_string(),
                                });
                            }
                        }
                    }
                    _ => {}
                }
            }
            Some("content_block_stop") => {
                let index = payload.get("index").and_then(Value::as_u64).unwrap_or(0);
                if let Some(OpenBlock::ToolUse { id, name, json_buf }) = self.blocks.remove(&index)
                {
                    let arguments = if json_buf.trim().is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&json_buf).unwrap_or_else(|e| {
                            warn!(tool = %name, error = %e, "Malformed tool arguments in stream");
                            json!({})
                        })
                    };
                    self.pending.push_back(StreamEvent::ToolCall { id, name, arguments });
                }
            }
            Some("message_delta") => {
                if let Some(reason) =
                    payload.pointer("/delta/stop_reason").and_then(Value::as_str)
                {
                    self.stop_reason = Some(reason.to_string());
                }
                if let Some(tokens) =
                    payload.pointer("/usage/output_tokens").and_then(Value::as_u64)
                {
                    self.output_tokens = tokens as u32;
                }
            }
            Some("message_stop") => {
                let usage = ModelUsage {
                    prompt_tokens: self.input_tokens,
                    completion_tokens: self.output_tokens,
                    total_tokens: self.input_tokens + self.output_tokens,
                };
                self.pending.push_back(StreamEvent::Finish {
                    reason: map_stop_reason(self.stop_reason.as_deref()),
                    usage: Some(usage),
                });
                self.done = true;
            }
            Some("error") => {
                let message = payload
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown stream error")
                    .to_string();
                self.pending.push_back(StreamEvent::Error { message });
                self.done = true;
            }
            // ping and unknown event types are ignored
            _ => {}
        }
    }
}

impl Stream for ClaudeEventStream {
    type Item = Result<StreamEvent, ModelError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if self.done {
                return Poll::Ready(None);
            }
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(data))) => self.handle_payload(&data),
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

// Claude API response structures

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ClaudeResponse {
    content: Vec<ClaudeContent>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<ClaudeUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClaudeContent {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ClaudeUsage {
    input_tokens: u32,
    output_tokens: u32,
}
