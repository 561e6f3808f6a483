//! Lenient timestamp parsing for persisted records
//!
//! Accepted forms: RFC 3339, naive ISO-8601 (taken as UTC), and Unix
//! seconds either as a number or a numeric string. Anything else parses to
//! `None` so callers can apply their own fallback.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

pub fn parse_str(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    raw.parse::<f64>().ok().and_then(from_epoch_seconds)
}

pub fn parse_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_str(s),
        Value::Number(n) => n.as_f64().and_then(from_epoch_seconds),
        _ => None,
    }
}

fn from_epoch_seconds(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    DateTime::<Utc>::from_timestamp_millis((secs * 1000.0).round() as i64)
}

/// Whole minutes elapsed since `since`, never negative
pub fn minutes_since(since: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - since).num_minutes().max(0)
}

/// `deserialize_with` helper: unparsable or missing timestamps become `None`
pub fn lenient<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(parse_value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_parse_rfc3339() {
        let ts = parse_str("2024-03-01T14:30:00Z").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-03-01T14:30:00+00:00");

        let offset = parse_str("2024-03-01T16:30:00+02:00").unwrap();
        assert_eq!(offset, ts);
    }

    #[test]
    fn test_parse_naive_iso() {
        let ts = parse_str("2024-03-01T14:30:00.250").unwrap();
        assert_eq!(ts.timestamp_millis() % 1000, 250);
        assert!(parse_str("2024-03-01 14:30:00").is_some());
    }

    #[test]
    fn test_parse_epoch() {
        let ts = parse_value(&json!(1_700_000_000)).unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert_eq!(parse_str("1700000000.5").unwrap().timestamp_millis(), 1_700_000_000_500);
    }

    #[test]
    fn test_unparsable() {
        assert!(parse_str("yesterday").is_none());
        assert!(parse_str("").is_none());
        assert!(parse_value(&json!(null)).is_none());
        assert!(parse_value(&json!({"at": 1})).is_none());
    }

    #[test]
    fn test_minutes_since_floors_and_clamps() {
        let now = Utc::now();
        assert_eq!(minutes_since(now - Duration::seconds(299), now), 4);
        assert_eq!(minutes_since(now + Duration::minutes(5), now), 0);
    }
}
