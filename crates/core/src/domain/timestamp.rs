//! Fixed fractional-seconds UTC timestamps, e.g. `2023-01-22T19:04:33.123000Z`.

use chrono::{DateTime, NaiveDateTime, SubsecRound, TimeZone, Utc};

use crate::error::{CoreError, Result};

/// Format used when writing timestamps.
pub const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Accepts any number of fractional digits; [`parse`] truncates to the
/// microseconds [`FORMAT`] writes.
const PARSE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.fZ";

pub fn format(value: &DateTime<Utc>) -> String {
    value.format(FORMAT).to_string()
}

pub fn parse(value: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, PARSE_FORMAT)
        .map(|naive| Utc.from_utc_datetime(&naive).trunc_subsecs(6))
        .map_err(|source| CoreError::InvalidTimestamp {
            value: value.to_string(),
            source,
        })
}

/// Current time truncated to the precision [`FORMAT`] can represent.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// `serde(with = "timestamp::option")` for `Option<DateTime<Utc>>` fields.
pub mod option {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(value) => serializer.serialize_str(&super::format(value)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(raw) => super::parse(&raw)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_format_has_six_fraction_digits() {
        let value = Utc.with_ymd_and_hms(2023, 1, 22, 19, 4, 33).unwrap();
        assert_eq!(format(&value), "2023-01-22T19:04:33.000000Z");
    }

    #[test]
    fn test_parse_accepts_millisecond_precision() {
        let parsed = parse("2023-02-21T10:00:00.123Z").unwrap();
        assert_eq!(parsed.nanosecond(), 123_000_000);
    }

    #[test]
    fn test_parse_truncates_to_written_precision() {
        let parsed = parse("2023-02-21T10:00:00.123456789Z").unwrap();
        assert_eq!(parsed.nanosecond(), 123_456_000);
        assert_eq!(format(&parsed), "2023-02-21T10:00:00.123456Z");
        assert_eq!(parse(&format(&parsed)).unwrap(), parsed);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse("yesterday"),
            Err(CoreError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn test_now_survives_format_round_trip() {
        let value = now();
        assert_eq!(parse(&format(&value)).unwrap(), value);
    }
}
