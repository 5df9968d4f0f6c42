use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    Connect,
    Transfer,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect => f.write_str("Connect"),
            Self::Transfer => f.write_str("Transfer"),
        }
    }
}

#[derive(Debug, Error)]
pub enum NetError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("JSON serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Invalid value for header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("Must specify {missing} if specifying {given}")]
    InvalidCookieScope {
        given: &'static str,
        missing: &'static str,
    },

    #[error("Proxy protocol \"{0}\" is not supported")]
    UnsupportedProxy(String),

    #[error("Invalid proxy '{spec}': {reason}")]
    InvalidProxy { spec: String, reason: String },

    #[error("A request body can be form data or JSON, not both")]
    ConflictingBody,

    #[error("{phase} timeout after {after:?}")]
    Timeout { phase: TimeoutPhase, after: Duration },

    #[error("Request was cancelled")]
    Cancelled,

    #[error("Could not read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Response body was already released")]
    BodyReleased,

    #[error("Response body is not valid {encoding}")]
    Decode { encoding: &'static str },

    #[error("Status {status} from {url}: {description}")]
    Status {
        status: u16,
        url: String,
        description: String,
    },
}

pub type Result<T> = std::result::Result<T, NetError>;
