//! Persistence for the authentication [`Session`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chatgpt_core::Session;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

#[async_trait]
pub trait TokenStore: Send + Sync {
    /// The stored session, or `None` when nothing usable is stored.
    async fn load(&self) -> Result<Option<Session>>;

    async fn save(&self, session: &Session) -> Result<()>;

    async fn clear(&self) -> Result<()>;
}

/// Stores the session as pretty JSON in `.session.json`.
///
/// A plain-text `.session` file written by older versions is migrated on
/// load. Hidden-file attributes are not managed; the dot prefix hides the
/// file on Unix-like systems.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
    legacy_path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>, legacy_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            legacy_path: legacy_path.into(),
        }
    }

    /// Store inside the app config dir `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(
            ClientConfig::session_path(dir),
            ClientConfig::legacy_session_path(dir),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ClientError + '_ {
        move |source| ClientError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    async fn migrate_legacy(&self) -> Result<()> {
        if !self.legacy_path.is_file() {
            return Ok(());
        }

        let token = fs::read_to_string(&self.legacy_path)
            .await
            .map_err(Self::io_error(&self.legacy_path))?;

        let mut session = Session::new();
        session.session_token = Some(token.trim().to_string()).filter(|t| !t.is_empty());
        self.save(&session).await?;

        fs::remove_file(&self.legacy_path)
            .await
            .map_err(Self::io_error(&self.legacy_path))?;
        info!(from = %self.legacy_path.display(), to = %self.path.display(), "Migrated legacy session file");
        Ok(())
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn load(&self) -> Result<Option<Session>> {
        self.migrate_legacy().await?;

        if !self.path.is_file() {
            debug!(path = %self.path.display(), "No session file");
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path)
            .await
            .map_err(Self::io_error(&self.path))?;

        match Session::from_json(&content) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Deleting unreadable session file");
                self.clear().await?;
                Ok(None)
            }
        }
    }

    async fn save(&self, session: &Session) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(Self::io_error(parent))?;
        }

        fs::write(&self.path, session.to_json()?)
            .await
            .map_err(Self::io_error(&self.path))?;
        debug!(path = %self.path.display(), "Session saved");
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_error(&self.path)(e)),
        }
    }
}

/// Keeps the session in memory only.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    session: Mutex<Option<Session>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: Session) -> Self {
        Self {
            session: Mutex::new(Some(session)),
        }
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load(&self) -> Result<Option<Session>> {
        Ok(self.session.lock().await.clone())
    }

    async fn save(&self, session: &Session) -> Result<()> {
        *self.session.lock().await = Some(session.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.session.lock().await = None;
        Ok(())
    }
}
