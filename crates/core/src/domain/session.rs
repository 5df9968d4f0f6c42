use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::timestamp;
use super::user::User;
use crate::error::Result;

/// Bot-challenge cookies captured for the chat host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudflareCookies {
    #[serde(default)]
    pub bm: Option<String>,
    #[serde(default)]
    pub unique_visitor_id: Option<String>,
    #[serde(default)]
    pub clearance: Option<String>,
    #[serde(default, with = "timestamp::option")]
    pub expires: Option<DateTime<Utc>>,
}

/// Persisted authentication state.
///
/// Serializes to the session-store layout:
/// `{"user": {...}|{}, "cloudflare": {...}, "expires": str|null,
/// "token": str|null, "user_agent": str|null}`. Absent values are written as
/// `null` (or `{}` for the user), never omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    #[serde(default, with = "user_field")]
    pub user: Option<User>,
    #[serde(default)]
    pub cloudflare: CloudflareCookies,
    #[serde(rename = "expires", default, with = "timestamp::option")]
    pub session_expires: Option<DateTime<Utc>>,
    #[serde(rename = "token", default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reset every field while keeping the value in place.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Whether a clearance cookie exists and has not expired yet.
    pub fn is_valid_clearance(&self) -> bool {
        self.is_valid_clearance_at(Utc::now())
    }

    pub fn is_valid_clearance_at(&self, now: DateTime<Utc>) -> bool {
        let has_value = self
            .cloudflare
            .clearance
            .as_deref()
            .is_some_and(|value| !value.is_empty());

        has_value && self.cloudflare.expires.is_some_and(|expires| expires > now)
    }

    /// Whether the session has a recorded expiry that lies before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.session_expires.is_some_and(|expires| expires < now)
    }
}

/// The user is written as `{}` when absent, and an empty object reads back
/// as `None`.
mod user_field {
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::domain::user::User;

    pub fn serialize<S>(value: &Option<User>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(user) => user.serialize(serializer),
            None => serializer.serialize_map(Some(0))?.end(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<User>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<serde_json::Value>::deserialize(deserializer)?;
        match value {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::Object(map)) if map.is_empty() => Ok(None),
            Some(other) => User::deserialize(other)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn populated() -> Session {
        Session {
            user: Some(User {
                id: "user-1".to_string(),
                name: "Ada".to_string(),
                email: "ada@example.com".to_string(),
                image: "img".to_string(),
                picture: "pic".to_string(),
                groups: ["staff".to_string()].into_iter().collect(),
                features: Default::default(),
            }),
            cloudflare: CloudflareCookies {
                bm: Some("bm-value".to_string()),
                unique_visitor_id: Some("uv".to_string()),
                clearance: Some("clearance-value".to_string()),
                expires: Some(timestamp::now() + Duration::hours(1)),
            },
            session_expires: Some(timestamp::parse("2030-01-01T00:00:00.000000Z").unwrap()),
            session_token: Some("token-value".to_string()),
            user_agent: Some("Mozilla/5.0".to_string()),
        }
    }

    #[test]
    fn test_empty_session_layout() {
        let value: serde_json::Value =
            serde_json::from_str(&Session::new().to_json().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "user": {},
                "cloudflare": {
                    "bm": null,
                    "unique_visitor_id": null,
                    "clearance": null,
                    "expires": null
                },
                "expires": null,
                "token": null,
                "user_agent": null
            })
        );
    }

    #[test]
    fn test_round_trip_empty() {
        let session = Session::new();
        let restored = Session::from_json(&session.to_json().unwrap()).unwrap();
        assert_eq!(restored, session);
    }

    #[test]
    fn test_round_trip_populated() {
        let session = populated();
        let restored = Session::from_json(&session.to_json().unwrap()).unwrap();
        assert_eq!(restored, session);
    }

    #[test]
    fn test_legacy_layout_without_cloudflare() {
        let session = Session::from_json(r#"{"user": {}, "expires": null, "token": "abc"}"#).unwrap();
        assert_eq!(session.session_token.as_deref(), Some("abc"));
        assert!(session.user.is_none());
        assert_eq!(session.cloudflare, CloudflareCookies::default());
    }

    #[test]
    fn test_invalid_timestamp_rejected() {
        let result = Session::from_json(r#"{"expires": "tomorrow"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut session = populated();
        session.clear();
        assert_eq!(session, Session::new());
    }

    #[test]
    fn test_clearance_validity() {
        let now = Utc::now();
        let mut session = populated();
        assert!(session.is_valid_clearance_at(now));

        session.cloudflare.expires = Some(now);
        assert!(!session.is_valid_clearance_at(now));

        session.cloudflare.expires = Some(now - Duration::seconds(1));
        assert!(!session.is_valid_clearance_at(now));

        session.cloudflare.expires = Some(now + Duration::hours(1));
        session.cloudflare.clearance = Some(String::new());
        assert!(!session.is_valid_clearance_at(now));

        session.cloudflare.clearance = Some("value".to_string());
        session.cloudflare.expires = None;
        assert!(!session.is_valid_clearance_at(now));
    }

    #[test]
    fn test_session_expiry() {
        let now = Utc::now();
        let mut session = Session::new();
        assert!(!session.is_expired_at(now));

        session.session_expires = Some(now - Duration::minutes(5));
        assert!(session.is_expired_at(now));
    }
}
