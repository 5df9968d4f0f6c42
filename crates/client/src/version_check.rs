//! Release check against the crates.io registry.

use events::{Event, EventBus};
use network::NetworkSession;
use semver::Version;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{ClientError, Result};

pub const CRATES_IO_API: &str = "https://crates.io/api/v1";

#[derive(Debug, Deserialize)]
struct CrateResponse {
    #[serde(rename = "crate")]
    krate: CrateInfo,
}

#[derive(Debug, Deserialize)]
struct CrateInfo {
    max_stable_version: Option<String>,
    max_version: String,
}

/// Compares the running version with the newest published release.
#[derive(Debug, Clone)]
pub struct VersionChecker {
    api_root: String,
    current: Version,
    http: NetworkSession,
    events: EventBus,
}

impl VersionChecker {
    /// `current` is the running version, usually `env!("CARGO_PKG_VERSION")`.
    pub fn new(current: &str, events: EventBus) -> Result<Self> {
        Self::with_api_root(CRATES_IO_API, current, events)
    }

    pub fn with_api_root(api_root: impl Into<String>, current: &str, events: EventBus) -> Result<Self> {
        let current = Version::parse(current)
            .map_err(|e| ClientError::VersionCheck(format!("invalid current version {current}: {e}")))?;

        let http = NetworkSession::new()?;
        // crates.io rejects anonymous user agents
        http.set_header(
            "User-Agent",
            concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")),
        );
        http.set_header("Accept", "application/json");

        Ok(Self {
            api_root: api_root.into().trim_end_matches('/').to_string(),
            current,
            http,
            events,
        })
    }

    pub fn current(&self) -> &Version {
        &self.current
    }

    /// Look up `package` and publish [`Event::NewerVersion`] when the
    /// registry has something newer. Returns the newer version, if any.
    pub async fn check(&self, package: &str) -> Result<Option<Version>> {
        let url = format!("{}/crates/{package}", self.api_root);
        let mut response = self.http.get(url).send_and_wait().await?.error_for_status()?;
        let body: CrateResponse = response.json().await?;

        let published = body
            .krate
            .max_stable_version
            .unwrap_or(body.krate.max_version);
        let latest = Version::parse(&published)
            .map_err(|e| ClientError::VersionCheck(format!("registry returned {published}: {e}")))?;

        if latest <= self.current {
            debug!(package, current = %self.current, latest = %latest, "Up to date");
            return Ok(None);
        }

        info!(package, current = %self.current, latest = %latest, "Newer version available");
        self.events.emit(Event::NewerVersion {
            package: package.to_string(),
            latest: latest.to_string(),
        });
        Ok(Some(latest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_current_version() {
        let err = VersionChecker::new("not-a-version", EventBus::new()).unwrap_err();
        assert!(matches!(err, ClientError::VersionCheck(_)));
    }

    #[test]
    fn test_api_root_trailing_slash() {
        let checker =
            VersionChecker::with_api_root("http://localhost/api/v1/", "1.2.3", EventBus::new())
                .unwrap();
        assert_eq!(checker.api_root, "http://localhost/api/v1");
        assert_eq!(checker.current(), &Version::new(1, 2, 3));
    }
}
