//! Heterogeneous timestamp parsing into UTC instants.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::Value;

/// Offset-bearing layouts tried after RFC 3339.
const OFFSET_PATTERNS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"];

/// Naive layouts, interpreted as UTC.
const NAIVE_PATTERNS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.fZ",
    "%Y-%m-%dT%H:%M:%SZ",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

const DATE_PATTERNS: &[&str] = &["%Y-%m-%d"];

/// Parses `raw` into a UTC instant.
///
/// Numbers are POSIX epoch seconds. Strings ending in `Z` are UTC; other strings
/// are tried as ISO-8601 with offset, then against a fixed list of layouts.
/// Naive times are taken as UTC, never local time.
pub fn parse_timestamp(raw: Option<&Value>) -> Option<DateTime<Utc>> {
    match raw? {
        Value::Number(n) => {
            if let Some(secs) = n.as_i64() {
                DateTime::from_timestamp(secs, 0)
            } else {
                n.as_f64().and_then(from_epoch_f64)
            }
        }
        Value::String(s) => parse_timestamp_str(s),
        _ => None,
    }
}

pub fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if let Some(body) = s.strip_suffix('Z').or_else(|| s.strip_suffix('z')) {
        if let Ok(dt) = DateTime::parse_from_rfc3339(&format!("{body}+00:00")) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for pattern in OFFSET_PATTERNS {
        if let Ok(dt) = DateTime::parse_from_str(s, pattern) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for pattern in NAIVE_PATTERNS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, pattern) {
            return Some(dt.and_utc());
        }
    }
    for pattern in DATE_PATTERNS {
        if let Ok(date) = NaiveDate::parse_from_str(s, pattern) {
            return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
        }
    }
    None
}

fn from_epoch_f64(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9).round().min(999_999_999.0) as u32;
    if whole < i64::MIN as f64 || whole > i64::MAX as f64 {
        return None;
    }
    DateTime::from_timestamp(whole as i64, nanos)
}

/// ISO-8601 with an explicit `+00:00` offset; microseconds only when non-zero.
pub fn format_utc(dt: DateTime<Utc>) -> String {
    let format = if dt.timestamp_subsec_nanos() == 0 {
        SecondsFormat::Secs
    } else {
        SecondsFormat::Micros
    };
    dt.to_rfc3339_opts(format, false)
}

/// Total normalization: any input yields a UTC timestamp, falling back to `now`.
pub fn normalize_timestamp(raw: Option<&Value>, now: DateTime<Utc>) -> String {
    format_utc(parse_timestamp(raw).unwrap_or(now))
}
