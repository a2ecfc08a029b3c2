//! Server-Sent Events framing over a reqwest byte stream.
//!
//! Both wire providers stream completions as SSE. This module handles the
//! transport framing only: splitting the byte stream into events and
//! extracting each event's `data:` payload. Interpreting the payloads is
//! provider-specific.

use cadre_abstraction::ModelError;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Yields the `data:` payload of each SSE event as a `String`.
///
/// Multi-line `data:` fields are joined with newlines per the SSE spec.
/// Comment lines (leading `:`) and `event:`/`id:` fields are dropped; the
/// providers here carry the event type inside the JSON payload.
pub(crate) struct SseDataStream {
    stream: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    buffer: String,
    done: bool,
}

impl SseDataStream {
    pub(crate) fn new(response: reqwest::Response) -> Self {
        Self { stream: Box::pin(response.bytes_stream()), buffer: String::new(), done: false }
    }

    /// Pops the next complete event from the buffer, if one is framed.
    fn pop_event(&mut self) -> Option<String> {
        let end_idx = self.buffer.find("\n\n")?;
        let event = self.buffer[..end_idx].to_string();
        self.buffer = self.buffer[end_idx + 2..].to_string();
        Self::extract_data(&event)
    }

    fn extract_data(event: &str) -> Option<String> {
        let mut data_lines = Vec::new();
        for line in event.lines() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
            }
        }
        if data_lines.is_empty() { None } else { Some(data_lines.join("\n")) }
    }
}

impl Stream for SseDataStream {
    type Item = Result<String, ModelError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        loop {
            // Drain any event already framed in the buffer.
            if let Some(data) = self.pop_event() {
                return Poll::Ready(Some(Ok(data)));
            }

            match self.stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(chunk) => {
                        self.buffer.push_str(&chunk);
                    }
                    Err(e) => {
                        self.done = true;
                        return Poll::Ready(Some(Err(ModelError::SerializationError(format!(
                            "Failed to decode SSE chunk: {}",
                            e
                        )))));
                    }
                },
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(ModelError::RequestError(format!(
                        "Stream error: {}",
                        e
                    )))));
                }
                Poll::Ready(None) => {
                    // Stream ended; a trailing event may lack the final blank line.
                    self.done = true;
                    if !self.buffer.is_empty() {
                        let rest = std::mem::take(&mut self.buffer);
                        if let Some(data) = Self::extract_data(&rest) {
                            return Poll::Ready(Some(Ok(data)));
                        }
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_data_single_line() {
        assert_eq!(
            SseDataStream::extract_data("event: message\ndata: {\"a\":1}"),
            Some("{\"a\":1}".to_string())
        );
    }

    #[test]
    fn test_extract_data_ignores_comments() {
        assert_eq!(SseDataStream::extract_data(": keep-alive"), None);
    }

    #[test]
    fn test_extract_data_joins_multi_line() {
        assert_eq!(
            SseDataStream::extract_data("data: line1\ndata: line2"),
            Some("line1\nline2".to_string())
        );
    }
}
