//! Parsing of the conversation endpoint's `text/event-stream` replies.
//!
//! Every frame carries the whole reply so far, so the complete reply is the
//! last data frame before the `[DONE]` sentinel:
//!
//! ```text
//! data: {"message": {...}, "conversation_id": "..."}\n\n
//! data: [DONE]\n\n
//! ```
//!
//! Split on blank lines this yields `[..., data, "data: [DONE]", ""]`.

use chatgpt_core::Message;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{ClientError, Result};

pub const FRAME_SEPARATOR: &str = "\n\n";
pub const DATA_PREFIX: &str = "data: ";
pub const DONE: &str = "[DONE]";

/// One decoded data frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReplyFrame {
    pub message: Message,
    pub conversation_id: Uuid,
}

/// Decode the payload of a single frame. `[DONE]` and anything that is not a
/// reply frame yield `None`.
pub fn parse_frame(data: &str) -> Option<ReplyFrame> {
    let payload = data.strip_prefix(DATA_PREFIX).unwrap_or(data).trim();
    if payload.is_empty() || payload == DONE {
        return None;
    }
    serde_json::from_str(payload).ok()
}

/// The finished reply of a complete event-stream body.
pub fn parse_reply(body: &str) -> Result<ReplyFrame> {
    let frames: Vec<&str> = body.split(FRAME_SEPARATOR).collect();
    if frames.len() < 3 {
        return Err(ClientError::MalformedStream(excerpt(body)));
    }

    let last = frames[frames.len() - 3];
    let payload = last.strip_prefix(DATA_PREFIX).unwrap_or(last).trim();
    serde_json::from_str(payload).map_err(|e| {
        ClientError::MalformedStream(format!("{e} in frame {}", excerpt(payload)))
    })
}

fn excerpt(text: &str) -> String {
    const LIMIT: usize = 200;
    match text.char_indices().nth(LIMIT) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}
