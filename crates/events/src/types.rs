//! Everything the network core tells a front-end about.

use std::collections::BTreeMap;

use chatgpt_core::{Conversation, Message, Session};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Notifications published on the [`crate::EventBus`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Conversation events
    /// A reply was received and appended to the conversation
    #[serde(rename = "message.received")]
    MessageReceived {
        message: Message,
        conversation: Conversation,
    },

    /// Partial reply text while the event stream is still open
    #[serde(rename = "message.progress")]
    MessageProgress {
        conversation_id: Option<Uuid>,
        message_id: Uuid,
        text: String,
    },

    // Authentication events
    /// No usable session token; the user has to sign in
    #[serde(rename = "auth.required")]
    AuthenticationRequired,

    /// Sign-in handshake completed
    #[serde(rename = "auth.successful")]
    AuthenticationSuccessful { session: Session },

    /// Sign-in handshake failed at some step
    #[serde(rename = "auth.failed")]
    AuthenticationFailed { username: String, error: String },

    /// The login page asked for a captcha; answer through `solve_captcha`
    #[serde(rename = "auth.captcha")]
    CaptchaEncountered { image: Vec<u8>, mime: String },

    /// Bot-challenge cookies were harvested
    #[serde(rename = "auth.clearance_updated")]
    ClearanceUpdated { cookies: BTreeMap<String, String> },

    /// The user agent paired with the clearance changed
    #[serde(rename = "auth.user_agent_updated")]
    UserAgentUpdated { user_agent: String },

    /// Session token was deleted
    #[serde(rename = "auth.signed_out")]
    SignedOut,

    // System events
    /// A newer release of a package is available
    #[serde(rename = "version.newer")]
    NewerVersion { package: String, latest: String },
}

impl Event {
    /// Whether this event concludes a sign-in attempt
    pub fn is_auth_outcome(&self) -> bool {
        matches!(
            self,
            Event::AuthenticationSuccessful { .. } | Event::AuthenticationFailed { .. }
        )
    }
}
