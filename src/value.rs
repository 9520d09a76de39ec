//! The nested value model shared by every engine.
//!
//! Records are JSON objects (`serde_json::Map`) with insertion order
//! preserved. Keys coming from outside (CSV headers, rule documents) are
//! brought to one canonical form before any lookup.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Map, Value};

/// A single flat or nested attribute record.
pub type Record = Map<String, Value>;

/// Canonical form of an attribute name: trimmed and ASCII-lowercased.
pub fn canonical_key(key: &str) -> String {
    key.trim().to_ascii_lowercase()
}

/// Returns a copy of `record` with every top-level key canonicalized.
///
/// Later keys win when two keys collapse to the same canonical name.
pub fn canonicalize_keys(record: &Record) -> Record {
    record
        .iter()
        .map(|(k, v)| (canonical_key(k), v.clone()))
        .collect()
}

/// Returns a copy of `value` with keys canonicalized at every depth.
pub fn canonicalize_deep(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (canonical_key(k), canonicalize_deep(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(canonicalize_deep).collect()),
        other => other.clone(),
    }
}

/// Structural deep copy of a value.
pub fn deep_copy(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), deep_copy(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(deep_copy).collect()),
        Value::String(s) => Value::String(s.clone()),
        Value::Number(n) => Value::Number(n.clone()),
        Value::Bool(b) => Value::Bool(*b),
        Value::Null => Value::Null,
    }
}

/// Renders a value the way it would appear in a flat file cell.
///
/// `null` renders as the empty string; containers render as JSON.
pub fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// String form of a scalar, or `None` for null, arrays and maps.
pub fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Null, the empty string, an empty list and an empty map are blank.
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// The `id` of a record as a string, if it has a non-blank one.
pub fn record_id(record: &Record) -> Option<String> {
    record
        .get("id")
        .filter(|v| !is_blank(v))
        .and_then(scalar_string)
}

/// Parses the timestamp formats seen in remote records and provider files.
///
/// Unzoned values are taken as UTC.
pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f %z", "%Y-%m-%d %H:%M:%S %z"] {
        if let Ok(dt) = DateTime::parse_from_str(input, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    let trimmed = input.trim_end_matches(" UTC").trim_end_matches('Z');
    for format in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Timestamp as a JSON value, via [`parse_timestamp`] for strings.
pub fn value_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    value.as_str().and_then(parse_timestamp)
}

/// Storage form of a timestamp. Lexical order equals time order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}
