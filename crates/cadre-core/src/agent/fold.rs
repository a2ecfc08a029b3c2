//! Stream folding.
//!
//! Turns the raw event sequence of one model turn into a [`FoldedTurn`]:
//! at most one text segment followed by zero or more finalized tool calls.

use crate::agent::AgentObserver;
use crate::error::{CoreError, Result};
use cadre_abstraction::{
    EventStream, FinishReason, ModelError, ModelUsage, StreamEvent, ToolUse,
};
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The folded result of one model turn.
#[derive(Debug, Default)]
pub struct FoldedTurn {
    /// Accumulated text.
    pub text: String,
    /// Accumulated reasoning text.
    pub thinking: String,
    /// Finalized tool calls in emission order.
    pub tool_calls: Vec<ToolUse>,
    /// Why the turn stopped.
    pub finish_reason: Option<FinishReason>,
    /// Usage reported at finish.
    pub usage: Option<ModelUsage>,
}

/// Tool calls being assembled from argument fragments.
#[derive(Default)]
struct PartialCalls {
    partials: Vec<(String, String, String)>, // (id, name, args buffer)
}

impl PartialCalls {
    fn accumulate(&mut self, id: &str, name: &str, fragment: &str) {
        if let Some(slot) = self.partials.iter_mut().find(|(pid, _, _)| pid == id) {
            slot.2.push_str(fragment);
        } else {
            self.partials.push((id.to_string(), name.to_string(), fragment.to_string()));
        }
    }

    fn take(&mut self, id: &str) -> Option<(String, String, String)> {
        let pos = self.partials.iter().position(|(pid, _, _)| pid == id)?;
        Some(self.partials.remove(pos))
    }

    /// Finalizes calls that only ever arrived as deltas.
    fn drain_into(&mut self, calls: &mut Vec<ToolUse>) {
        for (id, name, buf) in self.partials.drain(..) {
            let arguments = if buf.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&buf).unwrap_or_else(|e| {
                    warn!(tool = %name, error = %e, "Discarding malformed tool arguments");
                    json!({})
                })
            };
            calls.push(ToolUse { id, name, arguments });
        }
    }
}

/// Folds a model event stream, observing cancellation at every read.
///
/// # Errors
/// Returns `Cancelled` when the token trips, or a model error when the
/// stream yields an `Error` event or a transport failure.
pub async fn fold_stream(
    mut stream: EventStream,
    cancel: &CancellationToken,
    observer: &dyn AgentObserver,
    agent_name: &str,
) -> Result<FoldedTurn> {
    let mut turn = FoldedTurn::default();
    let mut pending = PartialCalls::default();
    let mut text_closed = false;

    loop {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        let event = tokio::select! {
            () = cancel.cancelled() => return Err(CoreError::Cancelled),
            event = stream.next() => event,
        };
        let Some(event) = event else {
            break;
        };

        match event? {
            StreamEvent::TextDelta { text } => {
                if text_closed {
                    // The text phase closed when tool calls began; trailing
                    // text would interleave with results, so drop it.
                    debug!(agent = %agent_name, "Ignoring text delta after tool phase began");
                    continue;
                }
                observer.on_text_delta(agent_name, &text);
                turn.text.push_str(&text);
            }
            StreamEvent::ReasoningDelta { text } => {
                observer.on_reasoning_delta(agent_name, &text);
                turn.thinking.push_str(&text);
            }
            StreamEvent::ToolCallDelta { id, name, arguments_delta } => {
                text_closed = true;
                pending.accumulate(&id, &name, &arguments_delta);
            }
            StreamEvent::ToolCall { id, name, arguments } => {
                text_closed = true;
                pending.take(&id);
                turn.tool_calls.push(ToolUse { id, name, arguments });
            }
            StreamEvent::File { mime_type, .. } => {
                debug!(agent = %agent_name, mime_type = %mime_type, "Model emitted a file");
            }
            StreamEvent::Error { message } => {
                return Err(CoreError::Model(ModelError::ModelResponseError(message)));
            }
            StreamEvent::Finish { reason, usage } => {
                turn.finish_reason = Some(reason);
                turn.usage = usage;
            }
        }
    }

    pending.drain_into(&mut turn.tool_calls);
    Ok(turn)
}
