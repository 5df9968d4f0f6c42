//! `requests`-style HTTP on top of `reqwest`.
//!
//! A [`NetworkSession`] owns the state shared between calls (default
//! headers, the cookie jar, the proxy). A [`Request`] describes one call and
//! is sent through a session, producing a [`Response`] whose body is read
//! lazily and cached.

pub mod cookies;
pub mod encoding;
pub mod error;
pub mod headers;
pub mod proxy;
pub mod request;
pub mod response;
pub mod session;
pub mod status;

pub use cookies::{Cookie, CookieJar};
pub use encoding::TextEncoding;
pub use error::{NetError, Result, TimeoutPhase};
pub use headers::{CaseInsensitiveMap, HeaderValue, KnownHeader};
pub use proxy::{ProxyConfig, ProxyProtocol};
pub use request::{ClientCert, Data, DispatchHooks, Request, RequestBuilder, Timeout, Verify};
pub use response::Response;
pub use session::NetworkSession;

pub use reqwest::{Method, StatusCode, Url};
pub use tokio_util::sync::CancellationToken;
