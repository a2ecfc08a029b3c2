//! OpenAI-compatible provider implementation.
//!
//! Works against OpenAI itself and any server speaking the same
//! `/chat/completions` contract (vLLM, LocalAI, LM Studio, Ollama's OpenAI
//! endpoint). Authentication is optional so local servers work out of the
//! box.
//!
//! This backend rejects images inside the tool role, so
//! `images_in_tool_results` is false: image-bearing tool results are
//! flattened to a placeholder here and re-sent by the caller in a follow-up
//! user turn.

use crate::sse::SseDataStream;
use async_trait::async_trait;
use cadre_abstraction::{
    EventStream, FinishReason, LanguageModel, LanguageRequest, LanguageResponse, Message,
    MessagePart, ModelError, ModelUsage, Role, StreamEvent, ToolResultContent, ToolUse,
};
use futures::Stream;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{debug, error, warn};

/// OpenAI-compatible provider.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    /// The model ID (e.g., "gpt-4o", "llama-3-8b").
    model_id: String,
    /// Optional API key; local servers typically need none.
    api_key: Option<String>,
    /// The base URL (e.g., "https://api.openai.com/v1").
    base_url: String,
    /// HTTP client for making requests.
    client: Client,
}

impl OpenAiProvider {
    /// Creates a new `OpenAiProvider` with Bearer authentication.
    #[must_use]
    pub fn new(model_id: String, base_url: String, api_key: String) -> Self {
        Self { model_id, api_key: Some(api_key), base_url, client: Client::new() }
    }

    /// Creates a provider for a local server that requires no authentication.
    #[must_use]
    pub fn without_auth(model_id: String, base_url: String) -> Self {
        Self { model_id, api_key: None, base_url, client: Client::new() }
    }

    fn to_wire_messages(messages: &[Message]) -> Vec<Value> {
        let mut wire = Vec::new();
        for msg in messages {
            match msg.role {
                Role::System => {
                    wire.push(json!({"role": "system", "content": msg.text_content()}));
                }
                Role::User => {
                    wire.push(json!({"role": "user", "content": Self::user_content(msg)}));
                }
                Role::Assistant => {
                    wire.push(Self::assistant_message(msg));
                }
                Role::Tool => {
                    // One wire message per tool result part.
                    for part in &msg.parts {
                        if let MessagePart::ToolResult { tool_call_id, content, .. } = part {
                            wire.push(json!({
                                "role": "tool",
                                "tool_call_id": tool_call_id,
                                "content": Self::flatten_result(content),
                            }));
                        }
                    }
                }
            }
        }
        wire
    }

    /// User content: a bare string when text-only, a part array otherwise.
    fn user_content(msg: &Message) -> Value {
        let multimodal = msg
            .parts
            .iter()
            .any(|p| matches!(p, MessagePart::Image { .. } | MessagePart::File { .. }));
        if !multimodal {
            return json!(msg.text_content());
        }
        let parts: Vec<Value> = msg
            .parts
            .iter()
            .filter_map(|part| match part {
                MessagePart::Text { text } => Some(json!({"type": "text", "text": text})),
                MessagePart::Image { data, mime_type } => Some(json!({
                    "type": "image_url",
                    "image_url": {"url": format!("data:{};base64,{}", mime_type, data)},
                })),
                MessagePart::File { mime_type, .. } => Some(json!({
                    "type": "text",
                    "text": format!("[attached file: {}]", mime_type),
                })),
                _ => None,
            })
            .collect();
        json!(parts)
    }

    fn assistant_message(msg: &Message) -> Value {
        let text = msg.text_content();
        let tool_calls: Vec<Value> = msg
            .parts
            .iter()
            .filter_map(|part| match part {
                MessagePart::ToolCall { id, name, arguments } => Some(json!({
                    "id": id,
                    "type": "function",
                    "function": {
                        "name": name,
                        "arguments": serde_json::to_string(arguments).unwrap_or_default(),
                    },
                })),
                _ => None,
            })
            .collect();

        let mut wire = json!({"role": "assistant"});
        wire["content"] = if text.is_empty() { Value::Null } else { json!(text) };
        if !tool_calls.is_empty() {
            wire["tool_calls"] = json!(tool_calls);
        }
        wire
    }

    /// Tool role content must be a string; images become placeholders.
    fn flatten_result(content: &[ToolResultContent]) -> String {
        let mut out = String::new();
        for block in content {
            match block {
                ToolResultContent::Text { text } => out.push_str(text),
                ToolResultContent::Image { mime_type, .. } => {
                    out.push_str(&format!("[image result: {}]", mime_type));
                }
            }
        }
        out
    }

    fn build_body(&self, request: &LanguageRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": self.model_id,
            "messages": Self::to_wire_messages(&request.messages),
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
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
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        },
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({"include_usage": true});
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, ModelError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut request = self.client.post(&url).json(body);
        if let Some(ref api_key) = self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|e| {
            error!(error = %e, url = %url, "Failed to send request to OpenAI-compatible API");
            ModelError::RequestError(format!("Network error: {}", e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            error!(status = %status, error = %error_text, url = %url, "OpenAI-compatible API returned error status");

            if status == 401 || status == 403 {
                return Err(ModelError::UnsupportedProvider(format!(
                    "Authentication failed ({}): {}",
                    status, error_text
                )));
            }
            if status == 402 || status == 429 {
                return Err(ModelError::QuotaExceeded {
                    provider: "openai".to_string(),
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

fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("stop") | None => FinishReason::Stop,
        Some("tool_calls" | "function_call") => FinishReason::ToolUse,
        Some("length") => FinishReason::Length,
        Some(_) => FinishReason::Other,
    }
}

#[async_trait]
impl LanguageModel for OpenAiProvider {
    async fn call(&self, request: &LanguageRequest) -> Result<LanguageResponse, ModelError> {
        debug!(
            model_id = %self.model_id,
            message_count = request.messages.len(),
            tool_count = request.tools.len(),
            "OpenAiProvider generating completion"
        );

        let body = self.build_body(request, false);
        let response = self.send(&body).await?;

        let completion: ChatCompletion = response.json().await.map_err(|e| {
            error!(error = %e, "Failed to parse OpenAI-compatible response");
            ModelError::SerializationError(format!("Failed to parse response: {}", e))
        })?;

        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::ModelResponseError("No choices in response".to_string()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| {
                let arguments = serde_json::from_str(&tc.function.arguments)
                    .unwrap_or_else(|_| json!({}));
                ToolUse { id: tc.id, name: tc.function.name, arguments }
            })
            .collect();

        let usage = completion.usage.map(|u| ModelUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        Ok(LanguageResponse {
            text: choice.message.content.unwrap_or_default(),
            thinking: choice.message.reasoning_content,
            tool_calls,
            finish_reason: map_finish_reason(choice.finish_reason.as_deref()),
            usage,
        })
    }

    async fn call_stream(&self, request: &LanguageRequest) -> Result<EventStream, ModelError> {
        debug!(
            model_id = %self.model_id,
            message_count = request.messages.len(),
            "OpenAiProvider generating streaming completion"
        );

        let body = self.build_body(request, true);
        let response = self.send(&body).await?;

        Ok(Box::pin(OpenAiEventStream::new(Box::pin(SseDataStream::new(response)))))
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// A tool call being assembled from indexed argument fragments.
struct PartialCall {
    id: String,
    name: String,
    json_buf: String,
}

/// Folds OpenAI-style SSE chunks into the provider-neutral event union.
///
/// Tool-call arguments stream as indexed fragments with no per-call stop
/// marker, so completed calls are finalized when the `[DONE]` sentinel (or
/// end of stream) arrives.
struct OpenAiEventStream {
    inner: Pin<Box<dyn Stream<Item = Result<String, ModelError>> + Send>>,
    partial_calls: Vec<PartialCall>,
    pending: VecDeque<StreamEvent>,
    finish_reason: Option<String>,
    usage: Option<ModelUsage>,
    done: bool,
}

impl OpenAiEventStream {
    fn new(inner: Pin<Box<dyn Stream<Item = Result<String, ModelError>> + Send>>) -> Self {
        Self {
            inner,
            partial_calls: Vec::new(),
            pending: VecDeque::new(),
            finish_reason: None,
            usage: None,
            done: false,
        }
    }

    fn handle_payload(&mut self, data: &str) {
        if data.trim() == "[DONE]" {
            self.finalize();
            return;
        }

        let chunk: StreamChunk = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => {
                // Some servers send empty or malformed keep-alive chunks.
                debug!("Skipping unparseable SSE chunk: {}", e);
                return;
            }
        };

        if let Some(u) = chunk.usage {
            self.usage = Some(ModelUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            });
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return;
        };

        if let Some(reason) = choice.finish_reason {
            self.finish_reason = Some(reason);
        }

        let Some(delta) = choice.delta else {
            return;
        };
        if let Some(text) = delta.content {
            if !text.is_empty() {
                self.pending.push_back(StreamEvent::TextDelta { text });
            }
        }
        if let Some(text) = delta.reasoning_content {
            if !text.is_empty() {
                self.pending.push_back(StreamEvent::ReasoningDelta { text });
            }
        }
        for fragment in delta.tool_calls.unwrap_or_default() {
            let index = fragment.index as usize;
            while self.partial_calls.len() <= index {
                self.partial_calls.push(PartialCall {
                    id: String::new(),
                    name: String::new(),
                    json_buf: String::new(),
                });
            }
            let slot = &mut self.partial_calls[index];
            if let Some(id) = fragment.id {
                slot.id = id;
            }
            if let Some(function) = fragment.function {
                if let Some(name) = function.name {
                    slot.name = name;
                }
                if let Some(arguments) = function.arguments {
                    slot.json_buf.push_str(&arguments);
                    self.pending.push_back(StreamEvent::ToolCallDelta {
                        id: slot.id.clone(),
                        name: slot.name.clone(),
                        arguments_delta: arguments,
                    });
                }
            }
        }
    }

    /// Emits finalized tool calls and the finish event.
    fn finalize(&mut self) {
        if self.done {
            return;
        }
        for call in self.partial_calls.drain(..) {
            let arguments = if call.json_buf.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&call.json_buf).unwrap_or_else(|e| {
                    warn!(tool = %call.name, error = %e, "Malformed tool arguments in stream");
                    json!({})
                })
            };
            self.pending.push_back(StreamEvent::ToolCall {
                id: call.id,
                name: call.name,
                arguments,
            });
        }
        self.pending.push_back(StreamEvent::Finish {
            reason: map_finish_reason(self.finish_reason.as_deref()),
            usage: self.usage,
        });
        self.done = true;
    }
}

impl Stream for OpenAiEventStream {
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
                    // Server closed without [DONE]; finalize what we have.
                    self.finalize();
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

// OpenAI-compatible API response structures

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallFragment>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallFragment {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionFragment>,
}

#[derive(Debug, Deserialize)]
struct FunctionFragment {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn payload_stream(
        payloads: Vec<&str>,
    ) -> Pin<Box<dyn Stream<Item = Result<String, ModelError>> + Send>> {
        Box::pin(futures::stream::iter(
            payloads.into_iter().map(|p| Ok(p.to_string())).collect::<Vec<_>>(),
        ))
    }

    #[test]
    fn test_assistant_tool_calls_serialized() {
        let msg = Message {
            role: Role::Assistant,
            parts: vec![
                MessagePart::text("Checking"),
                MessagePart::ToolCall {
                    id: "c1".to_string(),
                    name: "search".to_string(),
                    arguments: json!({"q": "rust"}),
                },
            ],
        };
        let wire = OpenAiProvider::assistant_message(&msg);
        assert_eq!(wire["content"], "Checking");
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "search");
        assert_eq!(wire["tool_calls"][0]["function"]["arguments"], r#"{"q":"rust"}"#);
    }

    #[test]
    fn test_tool_result_images_flattened() {
        let content = vec![
            ToolResultContent::Text { text: "took screenshot".to_string() },
            ToolResultContent::Image { data: "AAAA".to_string(), mime_type: "image/png".to_string() },
        ];
        let flat = OpenAiProvider::flatten_result(&content);
        assert!(flat.contains("took screenshot"));
        assert!(flat.contains("[image result: image/png]"));
    }

    #[tokio::test]
    async fn test_stream_tool_call_fragments_finalize_on_done() {
        let stream = OpenAiEventStream::new(payload_stream(vec![
            r#"{"choices":[{"delta":{"content":"Let me search."}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"search","arguments":"{\"q\":"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"rust\"}"}}]}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":7,"completion_tokens":3,"total_tokens":10}}"#,
            "[DONE]",
        ]));

        let events: Vec<StreamEvent> = stream.map(|e| e.unwrap()).collect::<Vec<_>>().await;

        assert!(matches!(&events[0], StreamEvent::TextDelta { text } if text == "Let me search."));
        let tool_call = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::ToolCall { id, name, arguments } => {
                    Some((id.clone(), name.clone(), arguments.clone()))
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(tool_call.0, "c1");
        assert_eq!(tool_call.1, "search");
        assert_eq!(tool_call.2, json!({"q": "rust"}));
        match events.last().unwrap() {
            StreamEvent::Finish { reason, usage } => {
                assert_eq!(*reason, FinishReason::ToolUse);
                assert_eq!(usage.unwrap().total_tokens, 10);
            }
            other => panic!("expected finish, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_call_against_mock_server() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"choices":[{"message":{"content":"hi there","tool_calls":[{"id":"c1","type":"function","function":{"name":"search","arguments":"{\"q\":\"x\"}"}}]},"finish_reason":"tool_calls"}],"usage":{"prompt_tokens":5,"completion_tokens":2,"total_tokens":7}}"#,
            )
            .create_async()
            .await;

        let provider = OpenAiProvider::without_auth("test-model".to_string(), server.url());
        let request = LanguageRequest::new(vec![Message::user("hello")]);
        let response = provider.call(&request).await.unwrap();

        assert_eq!(response.text, "hi there");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].arguments, json!({"q": "x"}));
        assert_eq!(response.finish_reason, FinishReason::ToolUse);
        assert_eq!(response.usage.unwrap().total_tokens, 7);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_call_stream_against_mock_server() {
        use futures::StreamExt as _;

        let mut server = mockito::Server::new_async().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let provider = OpenAiProvider::without_auth("test-model".to_string(), server.url());
        let request = LanguageRequest::new(vec![Message::user("hello")]);
        let stream = provider.call_stream(&request).await.unwrap();
        let events: Vec<StreamEvent> = stream.map(|e| e.unwrap()).collect::<Vec<_>>().await;

        let text: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::TextDelta { text } => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "hello");
        assert!(matches!(
            events.last().unwrap(),
            StreamEvent::Finish { reason: FinishReason::Stop, .. }
        ));
    }

    #[tokio::test]
    async fn test_429_maps_to_quota_exceeded() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(429)
            .with_body(r#"{"error":{"message":"rate limited"}}"#)
            .create_async()
            .await;

        let provider = OpenAiProvider::without_auth("test-model".to_string(), server.url());
        let request = LanguageRequest::new(vec![Message::user("hello")]);
        let err = provider.call(&request).await.unwrap_err();
        assert!(matches!(err, ModelError::QuotaExceeded { .. }));
    }

    #[tokio::test]
    async fn test_stream_finalizes_without_done_sentinel() {
        let stream = OpenAiEventStream::new(payload_stream(vec![
            r#"{"choices":[{"delta":{"content":"hi"},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
        ]));
        let events: Vec<StreamEvent> = stream.map(|e| e.unwrap()).collect::<Vec<_>>().await;
        assert!(matches!(
            events.last().unwrap(),
            StreamEvent::Finish { reason: FinishReason::Stop, .. }
        ));
    }
}
