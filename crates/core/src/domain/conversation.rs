use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::message::Message;
use crate::error::{CoreError, Result};

/// A conversation with the chat backend.
///
/// The id is issued by the server with the first reply. Messages are kept in
/// the order they were sent and received.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Option<Uuid>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the server-issued id. Re-assigning the same id is a no-op;
    /// a different id is rejected.
    pub fn assign_id(&mut self, id: Uuid) -> Result<()> {
        match self.id {
            None => {
                self.id = Some(id);
                Ok(())
            }
            Some(current) if current == id => Ok(()),
            Some(current) => Err(CoreError::ConversationIdImmutable {
                current,
                requested: id,
            }),
        }
    }

    /// The message the next outgoing message replies to.
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
