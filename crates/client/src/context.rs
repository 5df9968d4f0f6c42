//! Application-wide state, built once at startup and passed by reference.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use events::EventBus;

use crate::clearance::ClearanceProvider;
use crate::client::Client;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::token_store::{FileTokenStore, TokenStore};

pub struct AppContext {
    pub dir: PathBuf,
    pub config: ClientConfig,
    pub events: EventBus,
    pub client: Arc<Client>,
}

impl AppContext {
    /// Read the config in `dir` and build a client persisting its session
    /// next to it.
    pub async fn load(dir: &Path) -> Result<Self> {
        let config = ClientConfig::read(dir).await;
        let store: Arc<dyn TokenStore> = Arc::new(FileTokenStore::in_dir(dir));
        Self::with_store(dir, config, store, None).await
    }

    /// `clearance` replaces the configured static clearance values.
    pub async fn with_store(
        dir: &Path,
        config: ClientConfig,
        store: Arc<dyn TokenStore>,
        clearance: Option<Arc<dyn ClearanceProvider>>,
    ) -> Result<Self> {
        let events = EventBus::new();
        let client = match clearance {
            Some(clearance) => {
                Client::with_clearance(config.clone(), events.clone(), store, clearance).await?
            }
            None => Client::new(config.clone(), events.clone(), store).await?,
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            events,
            client: Arc::new(client),
        })
    }

    /// Persist the current config.
    pub async fn save_config(&self) -> Result<()> {
        self.config.write(&self.dir).await
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("dir", &self.dir)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}
