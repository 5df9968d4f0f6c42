use std::path::{Path, PathBuf};
use std::time::Duration;

use network::ProxyConfig;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::SESSION_ENV;

/// Directory name under the platform config dir.
pub const APP_DIR: &str = "chatgpt_gui";
const CONFIG_FILE: &str = "config.toml";
const SESSION_FILE: &str = ".session.json";
const LEGACY_SESSION_FILE: &str = ".session";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.1 Safari/605.1.15";

/// Client settings, read from `config.toml` in the app config dir.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Root of the chat web app and its backend API.
    pub chat_url: String,
    /// Root of the identity provider used by the sign-in handshake.
    pub auth_url: String,
    pub user_agent: String,
    /// `[protocol://][user[:pass]@]host:port`
    pub proxy: Option<String>,
    /// Takes precedence over the environment and the token store.
    pub session_token: Option<String>,
    /// Preferred model slug; the first advertised model is used otherwise.
    pub model: Option<String>,
    pub request_timeout_secs: u64,
    pub message_timeout_secs: u64,
    /// Bot-challenge cookies to use instead of launching a browser.
    pub cf_clearance: Option<String>,
    pub cf_bm: Option<String>,
    /// Check crates.io for a newer release on start.
    pub check_updates: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            chat_url: "https://chat.openai.com".to_string(),
            auth_url: "https://auth0.openai.com".to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            proxy: None,
            session_token: None,
            model: None,
            request_timeout_secs: 30,
            message_timeout_secs: 180,
            cf_clearance: None,
            cf_bm: None,
            check_updates: true,
        }
    }
}

impl ClientConfig {
    /// `<config dir>/chatgpt_gui`, if the platform has a config dir.
    pub fn default_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR))
    }

    pub fn config_path(dir: &Path) -> PathBuf {
        dir.join(CONFIG_FILE)
    }

    pub fn session_path(dir: &Path) -> PathBuf {
        dir.join(SESSION_FILE)
    }

    pub fn legacy_session_path(dir: &Path) -> PathBuf {
        dir.join(LEGACY_SESSION_FILE)
    }

    /// Read `config.toml` from `dir`, falling back to defaults when the file
    /// is missing or unreadable.
    pub async fn read(dir: &Path) -> Self {
        let config_path = Self::config_path(dir);

        if !config_path.exists() {
            debug!(path = %config_path.display(), "Config file does not exist, using defaults");
            return Self::default();
        }

        match fs::read_to_string(&config_path).await {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    debug!(path = %config_path.display(), "Config loaded successfully");
                    config
                }
                Err(e) => {
                    warn!(path = %config_path.display(), error = %e, "Failed to parse config, using defaults");
                    Self::default()
                }
            },
            Err(e) => {
                warn!(path = %config_path.display(), error = %e, "Failed to read config file, using defaults");
                Self::default()
            }
        }
    }

    pub async fn write(&self, dir: &Path) -> Result<()> {
        let io_error = |source| ClientError::Io {
            path: dir.to_path_buf(),
            source,
        };

        fs::create_dir_all(dir).await.map_err(io_error)?;

        let content = toml::to_string_pretty(self)
            .map_err(|e| ClientError::Io {
                path: Self::config_path(dir),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            })?;

        let config_path = Self::config_path(dir);
        fs::write(&config_path, content)
            .await
            .map_err(|source| ClientError::Io {
                path: config_path.clone(),
                source,
            })?;
        debug!(path = %config_path.display(), "Config saved successfully");

        Ok(())
    }

    /// Session token from the config, else from `CHATGPT_SESSION_AUTH`.
    pub fn token_override(&self) -> Option<String> {
        self.session_token
            .clone()
            .or_else(|| std::env::var(SESSION_ENV).ok())
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
    }

    pub fn proxy_config(&self) -> network::Result<ProxyConfig> {
        match self.proxy.as_deref().map(str::trim) {
            Some(spec) if !spec.is_empty() => ProxyConfig::parse(spec),
            _ => Ok(ProxyConfig::none()),
        }
    }

    /// Absolute URL of `path` under the chat root.
    pub fn chat_endpoint(&self, path: &str) -> String {
        join(&self.chat_url, path)
    }

    pub fn auth_endpoint(&self, path: &str) -> String {
        join(&self.auth_url, path)
    }

    /// Host name the session cookie is scoped to.
    pub fn chat_host(&self) -> String {
        url::Url::parse(&self.chat_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_owned))
            .unwrap_or_else(|| "chat.openai.com".to_string())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.message_timeout_secs)
    }
}

fn join(root: &str, path: &str) -> String {
    format!(
        "{}/{}",
        root.trim_end_matches('/'),
        path.trim().trim_start_matches('/')
    )
}
