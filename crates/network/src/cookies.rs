//! Cookie storage shared by every request of a [`crate::NetworkSession`].

use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use reqwest::header::HeaderValue as RawHeaderValue;
use tracing::debug;
use url::Url;

use crate::error::{NetError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// Lowercase, without a leading dot.
    pub domain: String,
    pub path: String,
    pub expires: Option<DateTime<Utc>>,
    pub secure: bool,
    pub http_only: bool,
    /// Set when the cookie came without a `Domain` attribute; it then only
    /// matches the exact host that set it.
    pub host_only: bool,
}

impl Cookie {
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        domain: &str,
        path: Option<&str>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: normalize_domain(domain),
            path: path.filter(|p| !p.is_empty()).unwrap_or("/").to_string(),
            expires: None,
            secure: false,
            http_only: false,
            host_only: false,
        }
    }

    /// Parse one `Set-Cookie` line received from `url`.
    pub fn parse(line: &str, url: &Url) -> Option<Self> {
        Self::parse_at(line, url, Utc::now())
    }

    pub(crate) fn parse_at(line: &str, url: &Url, now: DateTime<Utc>) -> Option<Self> {
        let mut parts = line.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        let host = url.host_str()?.to_ascii_lowercase();

        let mut cookie = Cookie {
            name: name.to_string(),
            value: value.trim().trim_matches('"').to_string(),
            domain: host.clone(),
            path: default_path(url),
            expires: None,
            secure: false,
            http_only: false,
            host_only: true,
        };

        let mut max_age = None;
        for attribute in parts {
            let (key, val) = match attribute.split_once('=') {
                Some((key, val)) => (key.trim(), val.trim()),
                None => (attribute.trim(), ""),
            };

            match key.to_ascii_lowercase().as_str() {
                "domain" if !val.is_empty() => {
                    let domain = normalize_domain(val);
                    if !domain_matches(&host, &domain) {
                        debug!(cookie = %cookie.name, %domain, %host, "Rejecting cookie for foreign domain");
                        return None;
                    }
                    cookie.domain = domain;
                    cookie.host_only = false;
                }
                "path" if val.starts_with('/') => cookie.path = val.to_string(),
                "expires" => cookie.expires = parse_cookie_date(val),
                "max-age" => max_age = val.parse::<i64>().ok(),
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                _ => {}
            }
        }

        // Max-Age takes precedence over Expires.
        if let Some(seconds) = max_age {
            cookie.expires = Some(if seconds <= 0 {
                DateTime::<Utc>::MIN_UTC
            } else {
                now + Duration::seconds(seconds)
            });
        }

        Some(cookie)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }

    pub fn matches(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();

        let domain_ok = if self.host_only {
            host == self.domain
        } else {
            domain_matches(&host, &self.domain)
        };

        domain_ok
            && path_matches(url.path(), &self.path)
            && (!self.secure || url.scheme() == "https")
    }

    fn same_identity(&self, other: &Cookie) -> bool {
        self.name == other.name && self.domain == other.domain && self.path == other.path
    }
}

/// Thread-safe cookie jar. Implements [`reqwest::cookie::CookieStore`] so a
/// `reqwest::Client` reads and writes it directly.
#[derive(Debug, Default)]
pub struct CookieJar {
    cookies: RwLock<Vec<Cookie>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Cookie>> {
        self.cookies.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Cookie>> {
        self.cookies.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every stored cookie as `name -> value`. When several cookies share a
    /// name, the most recently stored one wins.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.read()
            .iter()
            .map(|cookie| (cookie.name.clone(), cookie.value.clone()))
            .collect()
    }

    pub fn all(&self) -> Vec<Cookie> {
        self.read().clone()
    }

    /// Value of the most recently stored cookie called `name`, regardless of
    /// scope. Agrees with [`CookieJar::snapshot`].
    pub fn get(&self, name: &str) -> Option<String> {
        self.read()
            .iter()
            .rev()
            .find(|cookie| cookie.name == name)
            .map(|cookie| cookie.value.clone())
    }

    /// Remove every cookie called `name` in every domain and path. Returns
    /// how many were removed.
    pub fn remove_named(&self, name: &str) -> usize {
        let mut cookies = self.write();
        let before = cookies.len();
        cookies.retain(|cookie| cookie.name != name);
        before - cookies.len()
    }

    /// Insert a cookie, replacing one with the same name, domain and path.
    pub fn insert(&self, cookie: Cookie) {
        let mut cookies = self.write();
        cookies.retain(|existing| !existing.same_identity(&cookie));
        if !cookie.is_expired_at(Utc::now()) {
            cookies.push(cookie);
        }
    }

    /// Insert or replace a cookie; the path defaults to `/`.
    pub fn set(&self, name: &str, value: &str, domain: &str, path: Option<&str>) {
        self.insert(Cookie::new(name, value, domain, path));
    }

    /// Remove cookies at one of four levels of specificity:
    ///
    /// - no arguments: every cookie
    /// - `domain`: all cookies of that domain
    /// - `domain` and `path`: all cookies of that path within the domain
    /// - `domain`, `path` and `name`: that single cookie
    ///
    /// Returns whether anything was removed.
    pub fn clear(
        &self,
        domain: Option<&str>,
        path: Option<&str>,
        name: Option<&str>,
    ) -> Result<bool> {
        if name.is_some() && (domain.is_none() || path.is_none()) {
            return Err(NetError::InvalidCookieScope {
                given: "name",
                missing: "domain and path",
            });
        }
        if path.is_some() && domain.is_none() {
            return Err(NetError::InvalidCookieScope {
                given: "path",
                missing: "domain",
            });
        }

        let domain = domain.map(normalize_domain);
        let mut cookies = self.write();
        let before = cookies.len();
        cookies.retain(|cookie| {
            let doomed = domain.as_deref().map_or(true, |d| cookie.domain == d)
                && path.map_or(true, |p| cookie.path == p)
                && name.map_or(true, |n| cookie.name == n);
            !doomed
        });

        Ok(cookies.len() != before)
    }

    /// Cookies to send to `url`, longest path first.
    pub fn cookies_for(&self, url: &Url) -> Vec<(String, String)> {
        let now = Utc::now();
        let mut matching: Vec<Cookie> = self
            .read()
            .iter()
            .filter(|cookie| !cookie.is_expired_at(now) && cookie.matches(url))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        matching
            .into_iter()
            .map(|cookie| (cookie.name, cookie.value))
            .collect()
    }

    /// Store every cookie from a set of `Set-Cookie` lines.
    pub fn store_response_cookies<'a>(&self, lines: impl IntoIterator<Item = &'a str>, url: &Url) {
        for line in lines {
            match Cookie::parse(line, url) {
                Some(cookie) if cookie.is_expired_at(Utc::now()) => {
                    let mut cookies = self.write();
                    cookies.retain(|existing| !existing.same_identity(&cookie));
                }
                Some(cookie) => self.insert(cookie),
                None => debug!(%url, "Ignoring malformed Set-Cookie header"),
            }
        }
    }
}

impl reqwest::cookie::CookieStore for CookieJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &RawHeaderValue>, url: &Url) {
        let lines: Vec<&str> = cookie_headers
            .filter_map(|value| value.to_str().ok())
            .collect();
        self.store_response_cookies(lines, url);
    }

    fn cookies(&self, url: &Url) -> Option<RawHeaderValue> {
        let pairs = self.cookies_for(url);
        if pairs.is_empty() {
            return None;
        }
        RawHeaderValue::from_str(&render_cookie_header(&pairs)).ok()
    }
}

/// `name=value; name=value`
pub fn render_cookie_header(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ")
}

fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_start_matches('.').to_ascii_lowercase()
}

fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain
        || (host.len() > domain.len()
            && host.ends_with(domain)
            && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/')
            || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/'))
}

fn default_path(url: &Url) -> String {
    let path = url.path();
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(index) => path[..index].to_string(),
    }
}

fn parse_cookie_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Some(date.with_timezone(&Utc));
    }
    ["%a, %d-%b-%Y %H:%M:%S GMT", "%a, %d-%b-%y %H:%M:%S GMT", "%A, %d-%b-%y %H:%M:%S GMT"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}
