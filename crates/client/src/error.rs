use std::path::PathBuf;

use thiserror::Error;

use crate::state::AuthState;

/// Why a sign-in attempt stopped. Each variant names the handshake step.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Email or password is not provided for Authenticator")]
    MissingCredentials,

    #[error("Could not obtain bot-challenge clearance: {0}")]
    Clearance(String),

    #[error("CSRF token was not provided by endpoint call")]
    MissingCsrfToken,

    #[error("Could not start auth0 login (status {status}). Could be due to excessive login attempts")]
    SignInRejected { status: u16 },

    #[error("New url was not provided by initial auth0 sign-in")]
    MissingRedirectUrl,

    #[error("Unsuccessful request to given url \"{url}\" (status {status})")]
    RedirectFailed { url: String, status: u16 },

    #[error("Login state was not provided by {url}")]
    StateNotFound { url: String },

    #[error("Couldn't load the login page (status {status})")]
    LoginPageFailed { status: u16 },

    #[error("Error rendering captcha: {0}")]
    CaptchaRender(String),

    #[error("Captcha was not solved")]
    CaptchaAbandoned,

    #[error("Email was not a valid user")]
    InvalidAccount,

    #[error("Password or captcha was wrong")]
    WrongCredentials,

    #[error("Final login state was not provided after password")]
    FinalStateNotFound,

    #[error("Couldn't resume authorization state (status {status})")]
    ResumeFailed { status: u16 },

    #[error("While most of the process was successful, Auth0 didn't issue a session token, retry")]
    TokenNotIssued,

    #[error("Session endpoint did not confirm the sign-in: {0}")]
    SessionCheck(String),

    #[error("Another sign-in is already in progress")]
    InProgress,

    #[error(transparent)]
    Network(#[from] network::NetError),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Network(#[from] network::NetError),

    #[error(transparent)]
    Core(#[from] chatgpt_core::CoreError),

    #[error("JSON serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Could not access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Couldn't get model data from ChatGPT. Check to make sure you're authenticated")]
    NoModels,

    #[error("Message response is not a text/event-stream: {0}")]
    MalformedStream(String),

    #[error("Not signed in: sign in or provide a session token")]
    NotSignedIn,

    #[error("Unauthorized: the request was rejected again after refreshing the session")]
    Unauthorized,

    #[error("Invalid auth state transition from {from} to {to}")]
    InvalidTransition { from: AuthState, to: AuthState },

    #[error("Sign-in failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Version check failed: {0}")]
    VersionCheck(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
