use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use reqwest::redirect::Policy;
use reqwest::{Certificate, Identity, Method};
use tracing::{debug, info, warn};

use crate::cookies::CookieJar;
use crate::error::{NetError, Result};
use crate::headers::{CaseInsensitiveMap, HeaderValue};
use crate::proxy::ProxyConfig;
use crate::request::{ClientCert, Request, RequestBuilder, Verify};

const MAX_REDIRECTS: usize = 10;

/// Transport settings a single request may override.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct TransportOptions {
    pub allow_redirects: bool,
    /// `None` uses the session proxy.
    pub proxy: Option<ProxyConfig>,
    pub verify: Verify,
    pub cert: Option<ClientCert>,
}

impl TransportOptions {
    fn is_session_default(&self) -> bool {
        self.allow_redirects
            && self.proxy.is_none()
            && self.verify == Verify::Default
            && self.cert.is_none()
    }
}

struct SessionState {
    headers: RwLock<CaseInsensitiveMap<HeaderValue>>,
    jar: Arc<CookieJar>,
    proxy: RwLock<ProxyConfig>,
    client: RwLock<reqwest::Client>,
}

/// Connection state shared across requests: default headers, the cookie
/// jar and the proxy.
///
/// Cloning is cheap and every clone refers to the same state.
#[derive(Clone)]
pub struct NetworkSession {
    state: Arc<SessionState>,
}

impl NetworkSession {
    pub fn new() -> Result<Self> {
        Self::with_proxy(ProxyConfig::none())
    }

    pub fn with_proxy(proxy: ProxyConfig) -> Result<Self> {
        let jar = Arc::new(CookieJar::new());
        let client = build_client(
            &jar,
            &TransportOptions {
                allow_redirects: true,
                ..Default::default()
            },
            &proxy,
        )?;

        Ok(Self {
            state: Arc::new(SessionState {
                headers: RwLock::new(CaseInsensitiveMap::new()),
                jar,
                proxy: RwLock::new(proxy),
                client: RwLock::new(client),
            }),
        })
    }

    /// Snapshot of the default headers.
    pub fn headers(&self) -> CaseInsensitiveMap<HeaderValue> {
        self.state
            .headers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn header(&self, name: &str) -> Option<HeaderValue> {
        self.state
            .headers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    pub fn set_header(&self, name: impl Into<String>, value: impl Into<HeaderValue>) {
        self.state
            .headers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name, value.into());
    }

    pub fn remove_header(&self, name: &str) -> Option<HeaderValue> {
        self.state
            .headers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(name)
    }

    /// Every cookie in the jar as `name -> value`.
    pub fn cookies(&self) -> BTreeMap<String, String> {
        self.state.jar.snapshot()
    }

    pub fn cookie_jar(&self) -> &Arc<CookieJar> {
        &self.state.jar
    }

    /// Insert or replace a cookie; `path` defaults to `/`.
    pub fn set_cookie(&self, name: &str, value: &str, domain: &str, path: Option<&str>) {
        self.state.jar.set(name, value, domain, path);
    }

    /// Drop every cookie called `name`, whatever its domain and path.
    pub fn remove_cookies_named(&self, name: &str) -> usize {
        self.state.jar.remove_named(name)
    }

    /// See [`CookieJar::clear`].
    pub fn clear_cookies(
        &self,
        domain: Option<&str>,
        path: Option<&str>,
        name: Option<&str>,
    ) -> Result<bool> {
        self.state.jar.clear(domain, path, name)
    }

    pub fn proxy(&self) -> ProxyConfig {
        self.state
            .proxy
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Route later requests through `proxy`. Requests already in flight keep
    /// their transport.
    pub fn set_proxy(&self, proxy: ProxyConfig) -> Result<()> {
        let client = build_client(
            &self.state.jar,
            &TransportOptions {
                allow_redirects: true,
                ..Default::default()
            },
            &proxy,
        )?;
        info!(proxy = %proxy, "Session proxy changed");

        *self
            .state
            .client
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = client;
        *self
            .state
            .proxy
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = proxy;
        Ok(())
    }

    pub fn clear_proxy(&self) -> Result<()> {
        self.set_proxy(ProxyConfig::none())
    }

    /// The transport for a request: the shared session client, or a
    /// dedicated one sharing the cookie jar when the request overrides
    /// redirects, proxy or TLS settings.
    pub(crate) fn transport_for(&self, options: &TransportOptions) -> Result<reqwest::Client> {
        if options.is_session_default() {
            return Ok(self
                .state
                .client
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone());
        }

        let proxy = match &options.proxy {
            Some(proxy) => proxy.clone(),
            None => self.proxy(),
        };
        debug!(?options, "Building dedicated transport");
        build_client(&self.state.jar, options, &proxy)
    }

    pub fn request(&self, method: Method, url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(self.clone(), Request::new(method, url))
    }

    pub fn get(&self, url: impl Into<String>) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    pub fn head(&self, url: impl Into<String>) -> RequestBuilder {
        self.request(Method::HEAD, url)
    }

    pub fn post(&self, url: impl Into<String>) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    pub fn put(&self, url: impl Into<String>) -> RequestBuilder {
        self.request(Method::PUT, url)
    }

    pub fn delete(&self, url: impl Into<String>) -> RequestBuilder {
        self.request(Method::DELETE, url)
    }

    pub fn patch(&self, url: impl Into<String>) -> RequestBuilder {
        self.request(Method::PATCH, url)
    }
}

impl std::fmt::Debug for NetworkSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkSession")
            .field("headers", &self.headers().len())
            .field("cookies", &self.state.jar.all().len())
            .field("proxy", &self.proxy().to_string())
            .finish()
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|source| NetError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn build_client(
    jar: &Arc<CookieJar>,
    options: &TransportOptions,
    proxy: &ProxyConfig,
) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .cookie_provider(Arc::clone(jar))
        .redirect(if options.allow_redirects {
            Policy::limited(MAX_REDIRECTS)
        } else {
            Policy::none()
        });

    builder = match proxy.to_reqwest()? {
        Some(proxy) => builder.proxy(proxy),
        None => builder.no_proxy(),
    };

    match &options.verify {
        Verify::Default => {}
        Verify::Disabled => {
            warn!("TLS certificate verification is disabled for this request");
            builder = builder.danger_accept_invalid_certs(true);
        }
        Verify::CaBundle(path) => {
            for certificate in Certificate::from_pem_bundle(&read_file(path)?)? {
                builder = builder.add_root_certificate(certificate);
            }
        }
    }

    if let Some(cert) = &options.cert {
        let identity = match cert {
            ClientCert::Pem(path) => {
                let pem = read_file(path)?;
                Identity::from_pkcs8_pem(&pem, &pem)?
            }
            ClientCert::Pair { cert, key } => {
                Identity::from_pkcs8_pem(&read_file(cert)?, &read_file(key)?)?
            }
        };
        builder = builder.identity(identity);
    }

    Ok(builder.build()?)
}
