//! Case-insensitive header maps and typed values for well-known headers.

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName};
use url::Url;

use crate::error::{NetError, Result};

/// A map with case-insensitive string keys.
///
/// Lookups ignore case. Iteration yields keys with the casing they were last
/// assigned with, in insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseInsensitiveMap<V> {
    entries: Vec<(String, V)>,
}

impl<V> Default for CaseInsensitiveMap<V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<V> CaseInsensitiveMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(existing, _)| existing.eq_ignore_ascii_case(key))
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.position(key).map(|i| &self.entries[i].1)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut V> {
        self.position(key).map(|i| &mut self.entries[i].1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    /// Insert or replace `key`, remembering the casing used here. Returns the
    /// previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: V) -> Option<V> {
        let key = key.into();
        match self.position(&key) {
            Some(i) => {
                let (old_key, old_value) = std::mem::replace(&mut self.entries[i], (key, value));
                drop(old_key);
                Some(old_value)
            }
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        self.position(key).map(|i| self.entries.remove(i).1)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }
}

impl<V: Clone> CaseInsensitiveMap<V> {
    /// `self` overlaid with `other`; keys from `other` win.
    pub fn merged(&self, other: &Self) -> Self {
        let mut merged = self.clone();
        for (key, value) in other.iter() {
            merged.insert(key, value.clone());
        }
        merged
    }
}

impl<K: Into<String>, V> FromIterator<(K, V)> for CaseInsensitiveMap<V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (key, value) in iter {
            map.insert(key, value);
        }
        map
    }
}

impl<K: Into<String>, V> Extend<(K, V)> for CaseInsensitiveMap<V> {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (key, value) in iter {
            self.insert(key, value);
        }
    }
}

impl<V> IntoIterator for CaseInsensitiveMap<V> {
    type Item = (String, V);
    type IntoIter = std::vec::IntoIter<(String, V)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Collect a `reqwest` header map, joining repeated headers. `Set-Cookie`
/// lines are joined with newlines since cookie values may contain commas.
impl From<&HeaderMap> for CaseInsensitiveMap<String> {
    fn from(headers: &HeaderMap) -> Self {
        let mut map: CaseInsensitiveMap<String> = CaseInsensitiveMap::new();
        for (name, value) in headers {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            let separator = if name == reqwest::header::SET_COOKIE {
                "\n"
            } else {
                ", "
            };
            match map.get_mut(name.as_str()) {
                Some(existing) => {
                    existing.push_str(separator);
                    existing.push_str(&value);
                }
                None => {
                    map.insert(name.as_str(), value);
                }
            }
        }
        map
    }
}

/// A header value. Well-known headers accept the typed variants; every other
/// header is sent as the raw bytes of its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Text(String),
    Bytes(Vec<u8>),
    Date(DateTime<Utc>),
    List(Vec<String>),
    Cookies(Vec<(String, String)>),
    Url(Url),
    Length(u64),
}

impl HeaderValue {
    /// Plain rendering, used for headers without a structured encoding.
    pub fn to_raw(&self) -> Vec<u8> {
        match self {
            Self::Bytes(bytes) => bytes.clone(),
            other => other.to_string().into_bytes(),
        }
    }
}

impl std::fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Bytes(bytes) => f.write_str(&String::from_utf8_lossy(bytes)),
            Self::Date(date) => write!(f, "{}", http_date(date)),
            Self::List(items) => f.write_str(&items.join(", ")),
            Self::Cookies(pairs) => {
                let rendered: Vec<String> = pairs
                    .iter()
                    .map(|(name, value)| format!("{name}={value}"))
                    .collect();
                f.write_str(&rendered.join("; "))
            }
            Self::Url(url) => f.write_str(url.as_str()),
            Self::Length(length) => write!(f, "{length}"),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&String> for HeaderValue {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

impl From<Vec<u8>> for HeaderValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<DateTime<Utc>> for HeaderValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Date(value)
    }
}

impl From<Vec<String>> for HeaderValue {
    fn from(value: Vec<String>) -> Self {
        Self::List(value)
    }
}

impl From<Url> for HeaderValue {
    fn from(value: Url) -> Self {
        Self::Url(value)
    }
}

impl From<u64> for HeaderValue {
    fn from(value: u64) -> Self {
        Self::Length(value)
    }
}

fn http_date(date: &DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Headers with a structured encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownHeader {
    ContentDisposition,
    ContentType,
    ContentLength,
    Cookie,
    ETag,
    IfMatch,
    IfModifiedSince,
    IfNoneMatch,
    LastModified,
    Location,
    Server,
    SetCookie,
    UserAgent,
}

impl KnownHeader {
    pub const ALL: [KnownHeader; 13] = [
        Self::ContentDisposition,
        Self::ContentType,
        Self::ContentLength,
        Self::Cookie,
        Self::ETag,
        Self::IfMatch,
        Self::IfModifiedSince,
        Self::IfNoneMatch,
        Self::LastModified,
        Self::Location,
        Self::Server,
        Self::SetCookie,
        Self::UserAgent,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::ContentDisposition => "Content-Disposition",
            Self::ContentType => "Content-Type",
            Self::ContentLength => "Content-Length",
            Self::Cookie => "Cookie",
            Self::ETag => "ETag",
            Self::IfMatch => "If-Match",
            Self::IfModifiedSince => "If-Modified-Since",
            Self::IfNoneMatch => "If-None-Match",
            Self::LastModified => "Last-Modified",
            Self::Location => "Location",
            Self::Server => "Server",
            Self::SetCookie => "Set-Cookie",
            Self::UserAgent => "User-Agent",
        }
    }

    pub fn lookup(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|known| known.name().eq_ignore_ascii_case(name))
    }

    /// Render `value` in this header's wire format.
    pub fn encode(&self, value: &HeaderValue) -> Result<String> {
        let invalid = |reason: &str| NetError::InvalidHeader {
            name: self.name().to_string(),
            reason: reason.to_string(),
        };

        match self {
            Self::ContentLength => match value {
                HeaderValue::Length(length) => Ok(length.to_string()),
                other => other
                    .to_string()
                    .trim()
                    .parse::<u64>()
                    .map(|length| length.to_string())
                    .map_err(|_| invalid("expected a byte count")),
            },
            Self::IfModifiedSince | Self::LastModified => match value {
                HeaderValue::Date(date) => Ok(http_date(date)),
                other => {
                    let text = other.to_string();
                    Ok(DateTime::parse_from_rfc3339(&text)
                        .map(|date| http_date(&date.with_timezone(&Utc)))
                        .unwrap_or(text))
                }
            },
            Self::Location => match value {
                HeaderValue::Url(url) => Ok(url.to_string()),
                HeaderValue::Date(_) | HeaderValue::Cookies(_) => {
                    Err(invalid("expected a URL"))
                }
                other => Ok(other.to_string()),
            },
            Self::Cookie | Self::SetCookie => match value {
                HeaderValue::Date(_) | HeaderValue::Length(_) => {
                    Err(invalid("expected name/value pairs"))
                }
                other => Ok(other.to_string()),
            },
            Self::IfMatch | Self::IfNoneMatch => Ok(value.to_string()),
            Self::ContentDisposition
            | Self::ContentType
            | Self::ETag
            | Self::Server
            | Self::UserAgent => Ok(value.to_string()),
        }
    }
}

/// Render a header map for `reqwest`. Well-known headers go through
/// [`KnownHeader::encode`]; everything else is copied as raw bytes.
pub fn to_header_map(headers: &CaseInsensitiveMap<HeaderValue>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();

    for (name, value) in headers.iter() {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| NetError::InvalidHeader {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        let raw = match KnownHeader::lookup(name) {
            Some(known) => known.encode(value)?.into_bytes(),
            None => value.to_raw(),
        };

        let header_value = reqwest::header::HeaderValue::from_bytes(&raw).map_err(|e| {
            NetError::InvalidHeader {
                name: name.to_string(),
                reason: e.to_string(),
            }
        })?;
        map.insert(header_name, header_value);
    }

    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_lookup_ignores_case() {
        let mut headers = CaseInsensitiveMap::new();
        headers.insert("X-Foo", "bar".to_string());

        assert_eq!(headers.get("x-foo"), headers.get("X-Foo"));
        assert_eq!(headers.get("X-FOO").map(String::as_str), Some("bar"));
        assert!(headers.contains_key("x-FoO"));
    }

    #[test]
    fn test_insert_replaces_and_keeps_last_casing() {
        let mut headers = CaseInsensitiveMap::new();
        headers.insert("content-type", "text/plain".to_string());
        let previous = headers.insert("Content-Type", "application/json".to_string());

        assert_eq!(previous.as_deref(), Some("text/plain"));
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.keys().collect::<Vec<_>>(), vec!["Content-Type"]);
    }

    #[test]
    fn test_remove_with_other_case() {
        let mut headers: CaseInsensitiveMap<i32> = [("Accept", 1), ("DNT", 2)].into_iter().collect();
        assert_eq!(headers.remove("dnt"), Some(2));
        assert!(!headers.contains_key("DNT"));
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_merged_prefers_other() {
        let base: CaseInsensitiveMap<&str> = [("Accept", "*/*"), ("DNT", "1")].into_iter().collect();
        let overrides: CaseInsensitiveMap<&str> = [("accept", "text/event-stream")].into_iter().collect();

        let merged = base.merged(&overrides);
        assert_eq!(merged.get("ACCEPT"), Some(&"text/event-stream"));
        assert_eq!(merged.get("dnt"), Some(&"1"));
        assert_eq!(merged.keys().collect::<Vec<_>>(), vec!["accept", "DNT"]);
    }

    #[test]
    fn test_known_header_lookup() {
        assert_eq!(KnownHeader::lookup("user-agent"), Some(KnownHeader::UserAgent));
        assert_eq!(KnownHeader::lookup("ETAG"), Some(KnownHeader::ETag));
        assert_eq!(KnownHeader::lookup("X-OpenAI-Assistant-App-Id"), None);
    }

    #[test]
    fn test_typed_encodings() {
        let date = Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap();
        assert_eq!(
            KnownHeader::IfModifiedSince
                .encode(&HeaderValue::Date(date))
                .unwrap(),
            "Wed, 21 Oct 2015 07:28:00 GMT"
        );
        assert_eq!(
            KnownHeader::LastModified
                .encode(&HeaderValue::from("2015-10-21T07:28:00Z"))
                .unwrap(),
            "Wed, 21 Oct 2015 07:28:00 GMT"
        );
        assert_eq!(
            KnownHeader::Cookie
                .encode(&HeaderValue::Cookies(vec![
                    ("a".to_string(), "1".to_string()),
                    ("b".to_string(), "2".to_string()),
                ]))
                .unwrap(),
            "a=1; b=2"
        );
        assert_eq!(
            KnownHeader::IfNoneMatch
                .encode(&HeaderValue::List(vec!["\"x\"".to_string(), "\"y\"".to_string()]))
                .unwrap(),
            "\"x\", \"y\""
        );
    }

    #[test]
    fn test_content_length_validation() {
        assert_eq!(
            KnownHeader::ContentLength.encode(&HeaderValue::from("100")).unwrap(),
            "100"
        );
        assert!(matches!(
            KnownHeader::ContentLength.encode(&HeaderValue::from("lots")),
            Err(NetError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn test_to_header_map_raw_and_known() {
        let headers: CaseInsensitiveMap<HeaderValue> = [
            ("X-OpenAI-Assistant-App-Id", HeaderValue::from("")),
            ("Content-Length", HeaderValue::Length(12)),
        ]
        .into_iter()
        .collect();

        let map = to_header_map(&headers).unwrap();
        assert_eq!(map["x-openai-assistant-app-id"], "");
        assert_eq!(map["content-length"], "12");
    }

    #[test]
    fn test_from_reqwest_joins_set_cookie_with_newlines() {
        let mut raw = HeaderMap::new();
        raw.append("set-cookie", "a=1; Path=/".parse().unwrap());
        raw.append("set-cookie", "b=2; Path=/".parse().unwrap());
        raw.append("vary", "Accept".parse().unwrap());
        raw.append("vary", "Origin".parse().unwrap());

        let map = CaseInsensitiveMap::from(&raw);
        assert_eq!(map.get("Set-Cookie").unwrap(), "a=1; Path=/\nb=2; Path=/");
        assert_eq!(map.get("Vary").unwrap(), "Accept, Origin");
    }
}
