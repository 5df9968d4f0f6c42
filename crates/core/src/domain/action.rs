use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::conversation::Conversation;
use super::message::Message;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    #[default]
    Next,
    /// Older backend revisions used this for every send.
    Variant,
}

/// Outgoing request envelope for the conversation endpoint.
///
/// Built per send, serialized, then discarded.
#[derive(Debug, Clone, Serialize)]
pub struct Action {
    #[serde(rename = "action")]
    pub kind: ActionKind,
    pub messages: Vec<Message>,
    pub model: String,
    #[serde(rename = "parent_message_id")]
    pub parent_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<Uuid>,
}

impl Action {
    /// Chain `message` off the last message of `conversation`, or off a fresh
    /// root message when the conversation is empty.
    pub fn next(model: impl Into<String>, conversation: &Conversation, message: Message) -> Self {
        let parent_id = conversation
            .last_message()
            .map(|m| m.id)
            .unwrap_or_else(|| Message::root().id);

        Self {
            kind: ActionKind::Next,
            messages: vec![message],
            model: model.into(),
            parent_id,
            conversation_id: conversation.id,
        }
    }

    pub fn with_kind(mut self, kind: ActionKind) -> Self {
        self.kind = kind;
        self
    }
}
