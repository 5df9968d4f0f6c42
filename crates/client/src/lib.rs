//! Chat service client.
//!
//! [`Client`] sends messages and keeps the session token fresh,
//! [`Authenticator`] runs the interactive sign-in handshake, and
//! [`TokenStore`] persists the resulting [`chatgpt_core::Session`]. Everything
//! a front-end needs to know is published on an [`events::EventBus`].

pub mod auth;
pub mod clearance;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod state;
pub mod stream;
pub mod token_store;
pub mod version_check;

pub use auth::Authenticator;
pub use clearance::{Clearance, ClearanceProvider, StaticClearance};
pub use client::Client;
pub use config::ClientConfig;
pub use context::AppContext;
pub use error::{AuthError, ClientError, Result};
pub use state::{AuthState, AuthStateMachine};
pub use token_store::{FileTokenStore, MemoryTokenStore, TokenStore};
pub use version_check::VersionChecker;

#[cfg(feature = "chrome")]
pub use clearance::ChromeClearance;

/// Cookie carrying the long-lived session token.
pub const SESSION_COOKIE: &str = "__Secure-next-auth.session-token";

/// Environment variable that overrides the persisted session token.
pub const SESSION_ENV: &str = "CHATGPT_SESSION_AUTH";
