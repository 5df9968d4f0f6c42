use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Conversation already has id {current}, refusing to replace it with {requested}")]
    ConversationIdImmutable { current: Uuid, requested: Uuid },

    #[error("Invalid timestamp '{value}': {source}")]
    InvalidTimestamp {
        value: String,
        #[source]
        source: chrono::ParseError,
    },

    #[error("Invalid session data: {0}")]
    InvalidSession(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
