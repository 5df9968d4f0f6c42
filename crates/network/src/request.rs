//! One-shot HTTP call descriptors.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderValue as RawHeaderValue, CONTENT_TYPE, COOKIE};
use reqwest::Method;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::cookies::render_cookie_header;
use crate::error::{NetError, Result, TimeoutPhase};
use crate::headers::{self, CaseInsensitiveMap, HeaderValue};
use crate::proxy::ProxyConfig;
use crate::response::Response;
use crate::session::{NetworkSession, TransportOptions};

/// Default connect and transfer timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Methods whose requests carry no body.
const BODYLESS_METHODS: [&str; 5] = ["GET", "HEAD", "CONNECT", "OPTIONS", "TRACE"];

/// Request body other than JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Data {
    /// Sent as `application/x-www-form-urlencoded`.
    Form(Vec<(String, String)>),
    Raw(Vec<u8>),
}

/// How long a call may take. A zero duration disables that phase's limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    None,
    /// Same limit for the connect and transfer phases.
    Both(Duration),
    /// `connect` bounds the wait for response headers; `transfer` bounds the
    /// idle time between two body chunks.
    Split { connect: Duration, transfer: Duration },
}

impl Default for Timeout {
    fn default() -> Self {
        Self::Both(DEFAULT_TIMEOUT)
    }
}

impl Timeout {
    pub fn connect(&self) -> Option<Duration> {
        match self {
            Self::None => None,
            Self::Both(d) | Self::Split { connect: d, .. } => Some(*d),
        }
        .filter(|d| !d.is_zero())
    }

    pub fn transfer(&self) -> Option<Duration> {
        match self {
            Self::None => None,
            Self::Both(d) | Self::Split { transfer: d, .. } => Some(*d),
        }
        .filter(|d| !d.is_zero())
    }
}

impl From<Duration> for Timeout {
    fn from(value: Duration) -> Self {
        Self::Both(value)
    }
}

/// Server certificate verification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Verify {
    /// System trust store.
    #[default]
    Default,
    /// Accept any certificate. Insecure.
    Disabled,
    /// Trust the certificates in a PEM bundle in addition to the system store.
    CaBundle(PathBuf),
}

/// TLS client identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCert {
    /// One PEM file holding both the certificate chain and the PKCS#8 key.
    Pem(PathBuf),
    Pair { cert: PathBuf, key: PathBuf },
}

type FinishedHook = Box<dyn FnOnce(Result<Response>) + Send>;
type ProgressHook = Box<dyn FnMut(u64, Option<u64>) + Send>;

/// Callbacks for [`Request::dispatch`].
#[derive(Default)]
pub struct DispatchHooks {
    finished: Option<FinishedHook>,
    progress: Option<ProgressHook>,
}

impl DispatchHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once with the fully read response, which is dropped after the
    /// hook returns.
    pub fn on_finished(mut self, hook: impl FnOnce(Result<Response>) + Send + 'static) -> Self {
        self.finished = Some(Box::new(hook));
        self
    }

    /// Called for every received chunk with `(bytes so far, total if known)`.
    pub fn on_progress(mut self, hook: impl FnMut(u64, Option<u64>) + Send + 'static) -> Self {
        self.progress = Some(Box::new(hook));
        self
    }
}

impl std::fmt::Debug for DispatchHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchHooks")
            .field("finished", &self.finished.is_some())
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Everything needed to perform one HTTP call.
///
/// Options are collected with builder methods; errors from them (an
/// unserializable JSON body, a bad proxy) are reported when the request is
/// sent.
#[derive(Debug)]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) url: String,
    pub(crate) params: Vec<(String, String)>,
    pub(crate) data: Option<Data>,
    pub(crate) json: Option<serde_json::Value>,
    pub(crate) headers: CaseInsensitiveMap<HeaderValue>,
    pub(crate) cookies: BTreeMap<String, String>,
    pub(crate) auth: Option<(String, String)>,
    pub(crate) timeout: Timeout,
    pub(crate) allow_redirects: bool,
    pub(crate) proxy: Option<ProxyConfig>,
    pub(crate) verify: Verify,
    pub(crate) cert: Option<ClientCert>,
    pub(crate) cancellation: Option<CancellationToken>,
    error: Option<NetError>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            params: Vec::new(),
            data: None,
            json: None,
            headers: CaseInsensitiveMap::new(),
            cookies: BTreeMap::new(),
            auth: None,
            timeout: Timeout::default(),
            allow_redirects: true,
            proxy: None,
            verify: Verify::Default,
            cert: None,
            cancellation: None,
            error: None,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn fail(mut self, error: NetError) -> Self {
        if self.error.is_none() {
            self.error = Some(error);
        }
        self
    }

    /// Query parameter, merged over the URL's own query.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn form<K, V>(mut self, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let pairs = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.data = Some(Data::Form(pairs));
        self
    }

    pub fn body(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.data = Some(Data::Raw(bytes.into()));
        self
    }

    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => {
                self.json = Some(value);
                self
            }
            Err(e) => self.fail(e.into()),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(name, value.into());
        self
    }

    pub fn headers(mut self, headers: CaseInsensitiveMap<HeaderValue>) -> Self {
        self.headers = self.headers.merged(&headers);
        self
    }

    /// Cookie sent with this request only, on top of the session's jar.
    pub fn cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some((username.into(), password.into()));
        self
    }

    pub fn timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.timeout = timeout.into();
        self
    }

    /// Follow redirects (the default, at most 10 hops) or hand back the 3xx
    /// response as-is.
    pub fn allow_redirects(mut self, allow: bool) -> Self {
        self.allow_redirects = allow;
        self
    }

    /// Route this request through `proxy` instead of the session proxy.
    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Proxy map of protocol to address. The protocol selects the proxy type
    /// used for all traffic, so only one entry takes effect: the last one.
    pub fn proxies<P, A>(self, proxies: impl IntoIterator<Item = (P, A)>) -> Self
    where
        P: AsRef<str>,
        A: AsRef<str>,
    {
        let mut chosen = None;
        let mut count = 0usize;
        for (protocol, address) in proxies {
            count += 1;
            match ProxyConfig::from_parts(protocol.as_ref(), address.as_ref()) {
                Ok(config) => chosen = Some(config),
                Err(e) => return self.fail(e),
            }
        }
        if count > 1 {
            warn!(count, "Several proxies given; only the last one is used");
        }
        match chosen {
            Some(config) => self.proxy(config),
            None => self,
        }
    }

    pub fn verify(mut self, verify: Verify) -> Self {
        self.verify = verify;
        self
    }

    pub fn cert(mut self, cert: ClientCert) -> Self {
        self.cert = Some(cert);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Final URL with `params` merged over the existing query. A parameter
    /// replaces every existing query pair with the same key.
    pub(crate) fn resolved_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.url).map_err(|source| NetError::InvalidUrl {
            url: self.url.clone(),
            source,
        })?;

        if !self.params.is_empty() {
            let kept: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(key, _)| !self.params.iter().any(|(k, _)| k == key))
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();

            url.set_query(None);
            url.query_pairs_mut()
                .extend_pairs(kept.iter().chain(self.params.iter()));
        }

        Ok(url)
    }

    fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            allow_redirects: self.allow_redirects,
            proxy: self.proxy.clone(),
            verify: self.verify.clone(),
            cert: self.cert.clone(),
        }
    }

    /// Turn the descriptor into a `reqwest` request on the right transport.
    fn prepare(mut self, session: &NetworkSession) -> Result<Prepared> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }

        let has_body = self.data.is_some() || self.json.is_some();
        if has_body && BODYLESS_METHODS.contains(&self.method.as_str()) {
            warn!(
                method = %self.method,
                "{} requests do not support data attached to the request body. This data is likely to be ignored.",
                self.method
            );
        }
        if self.data.is_some() && self.json.is_some() {
            return Err(NetError::ConflictingBody);
        }

        let url = self.resolved_url()?;
        let transport = session.transport_for(&self.transport_options())?;

        let merged_headers = session.headers().merged(&self.headers);
        let mut header_map = headers::to_header_map(&merged_headers)?;

        // reqwest skips the cookie store when a Cookie header is present, so
        // per-request cookies carry the jar's matching cookies along.
        if !self.cookies.is_empty() && !header_map.contains_key(COOKIE) {
            let mut pairs: BTreeMap<String, String> =
                session.cookie_jar().cookies_for(&url).into_iter().collect();
            pairs.extend(self.cookies.clone());
            let pairs: Vec<(String, String)> = pairs.into_iter().collect();
            let value = RawHeaderValue::from_str(&render_cookie_header(&pairs)).map_err(|e| {
                NetError::InvalidHeader {
                    name: "Cookie".to_string(),
                    reason: e.to_string(),
                }
            })?;
            header_map.insert(COOKIE, value);
        }

        let mut builder = transport.request(self.method.clone(), url.clone());

        match self.data.take() {
            Some(Data::Form(pairs)) => builder = builder.form(&pairs),
            Some(Data::Raw(bytes)) => builder = builder.body(bytes),
            None => {}
        }
        if let Some(json) = self.json.take() {
            builder = builder.json(&json);
        }
        if header_map.contains_key(CONTENT_TYPE) {
            debug!(url = %url, "Keeping explicit Content-Type");
        }
        builder = builder.headers(header_map);

        if let Some((username, password)) = &self.auth {
            builder = builder.basic_auth(username, Some(password));
        }

        Ok(Prepared {
            builder,
            url,
            timeout: self.timeout,
            cancellation: self.cancellation,
        })
    }

    /// Send through `session` and resolve once the response head arrives.
    pub async fn send(self, session: &NetworkSession) -> Result<Response> {
        let method = self.method.clone();
        let prepared = self.prepare(session)?;
        debug!(%method, url = %prepared.url, "Sending request");

        let connect = prepared.timeout.connect();
        let cancellation = prepared.cancellation.clone();
        let call = guarded(prepared.builder.send(), connect, cancellation.as_ref());

        let response = call.await?;
        debug!(status = response.status().as_u16(), url = %prepared.url, "Response head received");

        Ok(Response::new(
            response,
            prepared.timeout.transfer(),
            prepared.cancellation,
        ))
    }

    /// Send and read the whole body before returning.
    pub async fn send_and_wait(self, session: &NetworkSession) -> Result<Response> {
        let mut response = self.send(session).await?;
        response.finish().await?;
        Ok(response)
    }

    /// Run the request on a background task, reporting through `hooks`.
    pub fn dispatch(self, session: &NetworkSession, hooks: DispatchHooks) -> JoinHandle<()> {
        let session = session.clone();
        let DispatchHooks { finished, progress } = hooks;

        tokio::spawn(async move {
            let outcome = match self.send(&session).await {
                Ok(mut response) => {
                    let read = match progress {
                        Some(mut progress) => {
                            response
                                .data_with_progress(|received, total| progress(received, total))
                                .await
                                .map(|_| ())
                        }
                        None => response.finish().await,
                    };
                    read.map(|()| response)
                }
                Err(e) => Err(e),
            };

            if let Err(e) = &outcome {
                debug!(error = %e, "Dispatched request failed");
            }
            if let Some(finished) = finished {
                finished(outcome);
            }
        })
    }
}

struct Prepared {
    builder: reqwest::RequestBuilder,
    url: Url,
    timeout: Timeout,
    cancellation: Option<CancellationToken>,
}

/// Await `future`, bounded by `limit` (reported as a connect timeout) and
/// aborted when `cancellation` fires.
pub(crate) async fn guarded<F, T>(
    future: F,
    limit: Option<Duration>,
    cancellation: Option<&CancellationToken>,
) -> Result<T>
where
    F: std::future::Future<Output = std::result::Result<T, reqwest::Error>>,
{
    guarded_phase(future, limit, TimeoutPhase::Connect, cancellation).await
}

pub(crate) async fn guarded_phase<F, T, E>(
    future: F,
    limit: Option<Duration>,
    phase: TimeoutPhase,
    cancellation: Option<&CancellationToken>,
) -> Result<T>
where
    F: std::future::Future<Output = std::result::Result<T, E>>,
    E: Into<NetError>,
{
    let bounded = async {
        match limit {
            Some(after) => match tokio::time::timeout(after, future).await {
                Ok(result) => result.map_err(Into::into),
                Err(_) => Err(NetError::Timeout { phase, after }),
            },
            None => future.await.map_err(Into::into),
        }
    };

    match cancellation {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(NetError::Cancelled),
            result = bounded => result,
        },
        None => bounded.await,
    }
}

/// [`Request`] bound to a [`NetworkSession`], as returned by the session
/// verbs.
#[derive(Debug)]
pub struct RequestBuilder {
    session: NetworkSession,
    request: Request,
}

macro_rules! forward {
    ($($(#[$meta:meta])* fn $name:ident($($arg:ident: $ty:ty),*);)*) => {
        $(
            $(#[$meta])*
            pub fn $name(mut self, $($arg: $ty),*) -> Self {
                self.request = self.request.$name($($arg),*);
                self
            }
        )*
    };
}

impl RequestBuilder {
    pub(crate) fn new(session: NetworkSession, request: Request) -> Self {
        Self { session, request }
    }

    forward! {
        fn param(key: impl Into<String>, value: impl Into<String>);
        fn body(bytes: impl Into<Vec<u8>>);
        fn header(name: impl Into<String>, value: impl Into<HeaderValue>);
        fn headers(headers: CaseInsensitiveMap<HeaderValue>);
        fn cookie(name: impl Into<String>, value: impl Into<String>);
        fn basic_auth(username: impl Into<String>, password: impl Into<String>);
        fn timeout(timeout: impl Into<Timeout>);
        fn allow_redirects(allow: bool);
        fn proxy(proxy: ProxyConfig);
        fn verify(verify: Verify);
        fn cert(cert: ClientCert);
        fn cancellation(token: CancellationToken);
    }

    pub fn form<K, V>(mut self, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.request = self.request.form(pairs);
        self
    }

    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        self.request = self.request.json(value);
        self
    }

    pub fn proxies<P, A>(mut self, proxies: impl IntoIterator<Item = (P, A)>) -> Self
    where
        P: AsRef<str>,
        A: AsRef<str>,
    {
        self.request = self.request.proxies(proxies);
        self
    }

    pub async fn send(self) -> Result<Response> {
        self.request.send(&self.session).await
    }

    pub async fn send_and_wait(self) -> Result<Response> {
        self.request.send_and_wait(&self.session).await
    }

    pub fn dispatch(self, hooks: DispatchHooks) -> JoinHandle<()> {
        self.request.dispatch(&self.session, hooks)
    }
}
