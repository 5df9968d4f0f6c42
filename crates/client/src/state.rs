use crate::error::{ClientError, Result};

/// Where the client is in the session-token lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AuthState {
    /// No session token from config, environment or the token store.
    #[default]
    NoToken,
    /// A session token is known but no access token has been minted yet.
    HasSessionToken,
    Refreshing,
    /// An access token is attached to outgoing requests.
    Authenticated,
    SignedOut,
}

impl AuthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoToken => "no_token",
            Self::HasSessionToken => "has_session_token",
            Self::Refreshing => "refreshing",
            Self::Authenticated => "authenticated",
            Self::SignedOut => "signed_out",
        }
    }

    pub fn has_token(&self) -> bool {
        matches!(
            self,
            Self::HasSessionToken | Self::Refreshing | Self::Authenticated
        )
    }
}

impl std::fmt::Display for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct AuthStateMachine;

impl AuthStateMachine {
    pub fn validate_transition(from: &AuthState, to: &AuthState) -> Result<()> {
        if from == to || Self::allowed_transitions(from).contains(to) {
            Ok(())
        } else {
            Err(ClientError::InvalidTransition {
                from: *from,
                to: *to,
            })
        }
    }

    fn allowed_transitions(from: &AuthState) -> Vec<AuthState> {
        match from {
            AuthState::NoToken => vec![AuthState::HasSessionToken, AuthState::SignedOut],
            AuthState::HasSessionToken => vec![AuthState::Refreshing, AuthState::SignedOut],
            AuthState::Refreshing => vec![
                AuthState::Authenticated,
                AuthState::HasSessionToken,
                AuthState::SignedOut,
            ],
            AuthState::Authenticated => vec![
                AuthState::Refreshing,
                AuthState::HasSessionToken,
                AuthState::SignedOut,
            ],
            AuthState::SignedOut => vec![AuthState::HasSessionToken],
        }
    }

    pub fn can_transition(from: &AuthState, to: &AuthState) -> bool {
        Self::validate_transition(from, to).is_ok()
    }
}
