//! Streaming event model.
//!
//! Providers expose completions as a pull-based sequence of [`StreamEvent`]s.
//! Consumers fold the sequence explicitly; there are no registered callbacks.

use crate::{FinishReason, ModelError, ModelUsage};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;

/// A lazily-pulled, forward-only sequence of stream events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ModelError>> + Send>>;

/// One event in a streaming completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    /// Incremental generated text.
    TextDelta {
        /// The text fragment.
        text: String,
    },
    /// Incremental reasoning/thinking text.
    ReasoningDelta {
        /// The reasoning fragment.
        text: String,
    },
    /// Incremental tool-call arguments. `arguments_delta` is a fragment of
    /// the serialized JSON arguments for the call identified by `id`.
    ToolCallDelta {
        /// Call id the fragment belongs to.
        id: String,
        /// Tool name (present on the first fragment of a call).
        name: String,
        /// Partial serialized JSON arguments.
        arguments_delta: String,
    },
    /// A fully-formed tool call.
    ToolCall {
        /// Provider-assigned call id.
        id: String,
        /// Tool name.
        name: String,
        /// Complete arguments.
        arguments: Value,
    },
    /// A file emitted by the model.
    File {
        /// MIME type.
        mime_type: String,
        /// Base64 payload.
        data: String,
    },
    /// A protocol-level error. Terminates the stream.
    Error {
        /// Provider error description.
        message: String,
    },
    /// End of the completion.
    Finish {
        /// Why the completion stopped.
        reason: FinishReason,
        /// Usage for the whole request, when reported.
        usage: Option<ModelUsage>,
    },
}
