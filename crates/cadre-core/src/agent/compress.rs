//! Rolling-history compression.
//!
//! Image and file attachments dominate context size. Before each model
//! turn, only the most recent image and the most recent file are kept in
//! the history; every older attachment is replaced with a short text
//! placeholder.

use cadre_abstraction::{Message, MessagePart, ToolResultContent};
use tracing::debug;

const IMAGE_PLACEHOLDER: &str = "[image omitted: superseded by a newer screenshot]";
const FILE_PLACEHOLDER: &str = "[file omitted: superseded by a newer attachment]";

/// Replaces all but the last image and all but the last file attachment
/// with placeholders. Returns how many attachments were replaced.
pub fn bound_attachments(messages: &mut [Message]) -> usize {
    let mut image_positions = Vec::new();
    let mut file_positions = Vec::new();

    for (mi, message) in messages.iter().enumerate() {
        for (pi, part) in message.parts.iter().enumerate() {
            match part {
                MessagePart::Image { .. } => image_positions.push((mi, pi, None)),
                MessagePart::File { .. } => file_positions.push((mi, pi, None)),
                MessagePart::ToolResult { content, .. } => {
                    for (bi, block) in content.iter().enumerate() {
                        if matches!(block, ToolResultContent::Image { .. }) {
                            image_positions.push((mi, pi, Some(bi)));
                        }
                    }
                }
                MessagePart::Text { .. } | MessagePart::ToolCall { .. } => {}
            }
        }
    }

    let mut replaced = 0;
    // Keep only the last entry of each kind.
    for positions in [&image_positions, &file_positions] {
        for &(mi, pi, block) in positions.iter().rev().skip(1) {
            replace(&mut messages[mi].parts[pi], block);
            replaced += 1;
        }
    }

    if replaced > 0 {
        debug!(replaced, "Compressed rolling history attachments");
    }
    replaced
}

fn replace(part: &mut MessagePart, block: Option<usize>) {
    match (part, block) {
        (MessagePart::ToolResult { content, .. }, Some(bi)) => {
            content[bi] = ToolResultContent::Text { text: IMAGE_PLACEHOLDER.to_string() };
        }
        (part @ MessagePart::Image { .. }, None) => {
            *part = MessagePart::text(IMAGE_PLACEHOLDER);
        }
        (part @ MessagePart::File { .. }, None) => {
            *part = MessagePart::text(FILE_PLACEHOLDER);
        }
        _ => {}
    }
}
