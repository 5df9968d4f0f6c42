use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// A message sent to or received from the chat backend.
///
/// Identity is the id; messages are never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub text: Option<String>,
    pub role: Role,
}

impl Message {
    /// A new user message carrying `text`.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: Some(text.into()),
            role: Role::User,
        }
    }

    /// A text-less message used as the parent of the first message in a
    /// conversation.
    pub fn root() -> Self {
        Self {
            id: Uuid::new_v4(),
            text: None,
            role: Role::User,
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::root()
    }
}

#[derive(Serialize, Deserialize)]
struct Content {
    #[serde(default = "text_content_type")]
    content_type: String,
    #[serde(default)]
    parts: Vec<String>,
}

fn text_content_type() -> String {
    "text".to_string()
}

#[derive(Deserialize)]
struct Author {
    role: Role,
}

#[derive(Serialize)]
struct MessageOut {
    id: Uuid,
    role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<Content>,
}

#[derive(Deserialize)]
struct MessageIn {
    id: Uuid,
    #[serde(default)]
    role: Option<Role>,
    #[serde(default)]
    author: Option<Author>,
    #[serde(default)]
    content: Option<Content>,
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        MessageOut {
            id: self.id,
            role: self.role,
            content: self.text.as_ref().map(|text| Content {
                content_type: text_content_type(),
                parts: vec![text.clone()],
            }),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = MessageIn::deserialize(deserializer)?;
        let role = wire
            .role
            .or(wire.author.map(|author| author.role))
            .unwrap_or_default();

        Ok(Self {
            id: wire.id,
            text: wire.content.map(|content| content.parts.join("\n\n")),
            role,
        })
    }
}
