//! Bot-challenge clearance: the `__cf_bm` / `cf_clearance` cookies and the
//! user agent they were issued to.

use async_trait::async_trait;

use crate::error::AuthError;

/// Cookies and user agent harvested from a solved challenge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Clearance {
    pub bm: Option<String>,
    pub clearance: Option<String>,
    pub user_agent: Option<String>,
}

impl Clearance {
    /// Cookie name/value pairs, for the cookie jar and update events.
    pub fn cookies(&self) -> Vec<(&'static str, String)> {
        let mut cookies = Vec::new();
        if let Some(bm) = &self.bm {
            cookies.push(("__cf_bm", bm.clone()));
        }
        if let Some(clearance) = &self.clearance {
            cookies.push(("cf_clearance", clearance.clone()));
        }
        cookies
    }
}

#[async_trait]
pub trait ClearanceProvider: Send + Sync {
    /// Obtain fresh clearance for `url`. `user_agent` is the agent already in
    /// use, if any; providers that control the agent may return another.
    async fn obtain(&self, url: &str, user_agent: Option<&str>) -> Result<Clearance, AuthError>;
}

/// Hands out preconfigured values, e.g. copied from a desktop browser.
#[derive(Debug, Clone, Default)]
pub struct StaticClearance {
    clearance: Clearance,
}

impl StaticClearance {
    pub fn new(clearance: Clearance) -> Self {
        Self { clearance }
    }
}

#[async_trait]
impl ClearanceProvider for StaticClearance {
    async fn obtain(&self, _url: &str, user_agent: Option<&str>) -> Result<Clearance, AuthError> {
        let mut clearance = self.clearance.clone();
        if clearance.user_agent.is_none() {
            clearance.user_agent = user_agent.map(str::to_owned);
        }
        Ok(clearance)
    }
}

#[cfg(feature = "chrome")]
pub use chrome::ChromeClearance;

#[cfg(feature = "chrome")]
mod chrome {
    use std::time::Duration;

    use async_trait::async_trait;
    use chromiumoxide::browser::{Browser, BrowserConfig};
    use chromiumoxide::cdp::browser_protocol::network::{
        EnableParams, EventRequestWillBeSentExtraInfo, EventResponseReceivedExtraInfo,
    };
    use futures::StreamExt;
    use regex::Regex;
    use tracing::{debug, info, warn};

    use super::{Clearance, ClearanceProvider};
    use crate::error::AuthError;

    const ARGS: [&str; 7] = [
        "--disable-extensions",
        "--disable-application-cache",
        "--disable-gpu",
        "--no-sandbox",
        "--disable-setuid-sandbox",
        "--disable-dev-shm-usage",
        "--incognito",
    ];

    /// Loads the chat page in a headless Chromium and reads the challenge
    /// cookies off the DevTools network events.
    #[derive(Debug, Clone)]
    pub struct ChromeClearance {
        timeout: Duration,
    }

    impl Default for ChromeClearance {
        fn default() -> Self {
            Self {
                timeout: Duration::from_secs(120),
            }
        }
    }

    impl ChromeClearance {
        pub fn new(timeout: Duration) -> Self {
            Self { timeout }
        }
    }

    fn header<'a>(headers: &'a serde_json::Value, name: &str) -> Option<&'a str> {
        headers.as_object()?.iter().find_map(|(key, value)| {
            key.eq_ignore_ascii_case(name)
                .then(|| value.as_str())
                .flatten()
        })
    }

    fn cookie_value(set_cookie: &str, name: &str) -> Option<String> {
        let pattern = Regex::new(&format!(r"(?:^|[\s;\n]){}=([^;\s]*)", regex::escape(name))).ok()?;
        pattern
            .captures(set_cookie)
            .map(|caps| caps[1].to_string())
            .filter(|value| !value.is_empty())
    }

    #[async_trait]
    impl ClearanceProvider for ChromeClearance {
        async fn obtain(&self, url: &str, user_agent: Option<&str>) -> Result<Clearance, AuthError> {
            let start = |e: String| {
                AuthError::Clearance(format!(
                    "Couldn't start Chrome. Make sure you have Google Chrome installed ({e})"
                ))
            };

            let mut args: Vec<String> = ARGS.iter().map(ToString::to_string).collect();
            if let Some(agent) = user_agent {
                args.push(format!("--user-agent={agent}"));
            }

            let config = BrowserConfig::builder().args(args).build().map_err(start)?;
            let (mut browser, mut handler) =
                Browser::launch(config).await.map_err(|e| start(e.to_string()))?;
            let handler_task = tokio::spawn(async move {
                while let Some(event) = handler.next().await {
                    if event.is_err() {
                        break;
                    }
                }
            });

            let harvest = async {
                let cdp = |e: chromiumoxide::error::CdpError| AuthError::Clearance(e.to_string());

                let page = browser.new_page("about:blank").await.map_err(cdp)?;
                page.execute(EnableParams::default()).await.map_err(cdp)?;
                let mut responses = page
                    .event_listener::<EventResponseReceivedExtraInfo>()
                    .await
                    .map_err(cdp)?;
                let mut requests = page
                    .event_listener::<EventRequestWillBeSentExtraInfo>()
                    .await
                    .map_err(cdp)?;

                page.goto(url).await.map_err(cdp)?;

                let mut clearance = Clearance::default();

                while clearance.clearance.is_none() || clearance.user_agent.is_none() {
                    tokio::select! {
                        Some(event) = responses.next() => {
                            let Some(set_cookie) = header(event.headers.inner(), "set-cookie") else {
                                continue;
                            };
                            if let Some(bm) = cookie_value(set_cookie, "__cf_bm") {
                                debug!("Harvested __cf_bm");
                                clearance.bm = Some(bm);
                            }
                            if let Some(value) = cookie_value(set_cookie, "cf_clearance") {
                                debug!("Harvested cf_clearance");
                                clearance.clearance = Some(value);
                            }
                        }
                        Some(event) = requests.next(), if clearance.user_agent.is_none() => {
                            if let Some(agent) = header(event.headers.inner(), "user-agent") {
                                clearance.user_agent = Some(agent.to_string());
                            }
                        }
                        else => {
                            return Err(AuthError::Clearance(
                                "Browser closed before clearance was issued".to_string(),
                            ));
                        }
                    }
                }

                Ok(clearance)
            };

            let outcome = match tokio::time::timeout(self.timeout, harvest).await {
                Ok(outcome) => outcome,
                Err(_) => Err(AuthError::Clearance(format!(
                    "No clearance issued within {:?}",
                    self.timeout
                ))),
            };

            if let Err(e) = browser.close().await {
                warn!(error = %e, "Failed to close browser");
            }
            if let Err(e) = browser.wait().await {
                debug!(error = %e, "Browser process did not exit cleanly");
            }
            handler_task.abort();

            if outcome.is_ok() {
                info!("Bot-challenge clearance obtained");
            }
            outcome
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_cookie_value() {
            let header = "__cf_bm=abc.def; path=/; HttpOnly\ncf_clearance=xyz; path=/";
            assert_eq!(cookie_value(header, "__cf_bm").as_deref(), Some("abc.def"));
            assert_eq!(cookie_value(header, "cf_clearance").as_deref(), Some("xyz"));
            assert_eq!(cookie_value(header, "missing"), None);
        }

        #[test]
        fn test_header_lookup_ignores_case() {
            let headers = serde_json::json!({"User-Agent": "HeadlessChrome"});
            assert_eq!(header(&headers, "user-agent"), Some("HeadlessChrome"));
        }
    }
}
