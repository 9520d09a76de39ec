//! Row reshaping shared by the flat-file processors.
//!
//! Import rows arrive flat, with nested objects spread over prefixed
//! columns. Export rows go the other way.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;

use crate::value::{is_blank, Record};

static US_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,2})/(\d{1,2})/(\d{4})(.*)$").expect("US date pattern is valid")
});

static POSITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([\d.\-]+)[^\d\-]+([\d.\-]+)\s*$").expect("position pattern is valid")
});

/// Column prefixes that fold into a nested `<name>_attributes` object on import.
pub const NESTED_PREFIXES: [(&str, &str, bool); 4] = [
    ("customer_address_", "customer_address_attributes", true),
    ("pick_up_location_", "pick_up_location_attributes", true),
    ("drop_off_location_", "drop_off_location_attributes", true),
    ("trip_result_", "trip_result_attributes", false),
];

/// Numbered columns (`trip_funders_1`, `trip_funders_2`...) that form a list.
pub const ARRAY_FIELDS: [&str; 4] = [
    "customer_eligibility_factors",
    "customer_mobility_factors",
    "customer_service_animals",
    "trip_funders",
];

/// Numbered `_N_key`/`_N_value` column pairs that form a map.
pub const HSTORE_FIELDS: [&str; 1] = ["customer_identifiers"];

/// Maps that are flattened by recursion on export. Any other map is a
/// key/value attribute.
const FLATTENED_GROUPS: [&str; 5] = [
    "customer_address",
    "pick_up_location",
    "drop_off_location",
    "originator",
    "address",
];

const DATE_SUFFIXES: [&str; 5] = ["date", "time", "at", "on", "dob"];

/// Applies every import reshaping step to a parsed row.
pub fn preprocess_row(row: &mut Record) {
    handle_nested_objects(row);
    handle_array_and_hstore_attributes(row);
    handle_date_conversions(row);
}

/// Removes the columns starting with `prefix` and returns them without it.
pub fn nested_object_to_record(row: &mut Record, prefix: &str) -> Record {
    let keys: Vec<String> = row
        .keys()
        .filter(|k| k.starts_with(prefix) && !k.ends_with("_attributes"))
        .cloned()
        .collect();

    let mut nested = Record::new();
    for key in keys {
        if let Some(value) = row.remove(&key) {
            nested.insert(key[prefix.len()..].to_string(), value);
        }
    }
    nested
}

/// Merges `nested` into the map at `name`, replacing a non-map value.
pub fn merge_record_into_row(row: &mut Record, name: &str, nested: Record) {
    if nested.is_empty() {
        return;
    }
    if !matches!(row.get(name), Some(Value::Object(_))) {
        row.insert(name.to_string(), Value::Object(Record::new()));
    }
    if let Some(Value::Object(existing)) = row.get_mut(name) {
        existing.extend(nested);
    }
}

pub fn handle_nested_objects(row: &mut Record) {
    for (prefix, name, is_location) in NESTED_PREFIXES {
        let mut nested = nested_object_to_record(row, prefix);
        if is_location {
            normalize_location_coordinates(&mut nested);
        }
        merge_record_into_row(row, name, nested);
    }
}

/// Rewrites `lat`/`lon` or a free-form `position` as WKT `POINT(lon lat)`.
pub fn normalize_location_coordinates(location: &mut Record) {
    let lat = location.remove("lat").filter(|v| !is_blank(v));
    let lon = location.remove("lon").filter(|v| !is_blank(v));
    let position = location.remove("position");

    let point = match (lon, lat) {
        (Some(lon), Some(lat)) => Some(Value::String(format!(
            "POINT({} {})",
            crate::value::display(&lon).trim(),
            crate::value::display(&lat).trim()
        ))),
        _ => match position {
            Some(Value::String(text)) if !text.trim().is_empty() => {
                let point = POSITION
                    .captures(&text)
                    .map(|caps| format!("POINT({} {})", &caps[1], &caps[2]))
                    .unwrap_or(text);
                Some(Value::String(point))
            }
            other => other,
        },
    };

    if let Some(point) = point {
        location.insert("position".to_string(), point);
    }
}

pub fn handle_array_and_hstore_attributes(row: &mut Record) {
    for field in ARRAY_FIELDS {
        let mut items = Vec::new();
        for i in 1.. {
            let key = format!("{}_{}", field, i);
            match row.get(&key) {
                Some(value) if !is_blank(value) => {}
                _ => break,
            }
            if let Some(value) = row.remove(&key) {
                items.push(value);
            }
        }
        if items.is_empty() {
            continue;
        }
        match row.get_mut(field) {
            Some(Value::Array(existing)) => existing.extend(items),
            _ => {
                row.insert(field.to_string(), Value::Array(items));
            }
        }
    }

    for field in HSTORE_FIELDS {
        let mut pairs = Record::new();
        for i in 1.. {
            let key_column = format!("{}_{}_key", field, i);
            let value_column = format!("{}_{}_value", field, i);
            let present = row.get(&key_column).is_some_and(|v| !is_blank(v))
                && row.contains_key(&value_column);
            if !present {
                break;
            }
            let key = row.remove(&key_column).map(|v| crate::value::display(&v)).unwrap_or_default();
            let value = row.remove(&value_column).unwrap_or(Value::Null);
            pairs.insert(key, value);
        }
        if !pairs.is_empty() {
            merge_record_into_row(row, field, pairs);
        }
    }
}

/// Rewrites `mm/dd/yyyy` values in date-like columns as ISO `yyyy-mm-dd`.
///
/// Anything after the date (usually a time) is kept. Returns true if a
/// value changed.
pub fn handle_date_conversions(row: &mut Record) -> bool {
    let mut changed = false;
    for (key, value) in row.iter_mut() {
        let is_date_column = key
            .rsplit_once('_')
            .is_some_and(|(_, suffix)| DATE_SUFFIXES.contains(&suffix));
        if !is_date_column {
            continue;
        }
        let Value::String(text) = value else { continue };
        let Some(caps) = US_DATE.captures(text) else { continue };
        let (Ok(month), Ok(day)) = (caps[1].parse::<u32>(), caps[2].parse::<u32>()) else {
            continue;
        };
        let converted = format!("{}-{:02}-{:02}{}", &caps[3], month, day, &caps[4]);
        *value = Value::String(converted);
        changed = true;
    }
    changed
}

/// Flattens a record to one level for a flat file.
///
/// Known location groups recurse with `parent_child` names, other maps
/// become `_N_key`/`_N_value` columns and lists become `_N` columns.
/// Keys in `except` are left as they are.
pub fn flatten_record(record: &Record, except: &[String], prefix: Option<&str>) -> Record {
    let mut flat = Record::new();
    for (key, value) in record {
        let name = match prefix {
            Some(prefix) => format!("{}_{}", prefix, key),
            None => key.clone(),
        };
        if except.iter().any(|k| k == key) {
            flat.insert(name, value.clone());
            continue;
        }
        match value {
            Value::Object(map) if FLATTENED_GROUPS.contains(&key.as_str()) => {
                flat.extend(flatten_record(map, except, Some(&name)));
            }
            Value::Object(map) => {
                for (i, (k, v)) in map.iter().enumerate() {
                    flat.insert(format!("{}_{}_key", name, i + 1), Value::String(k.clone()));
                    flat.insert(format!("{}_{}_value", name, i + 1), v.clone());
                }
            }
            Value::Array(items) => {
                for (i, v) in items.iter().enumerate() {
                    flat.insert(format!("{}_{}", name, i + 1), v.clone());
                }
            }
            other => {
                flat.insert(name, other.clone());
            }
        }
    }
    flat
}

/// `YYYY-MM-DD.HHMMSS`, used in export file names.
pub fn timestamp_string(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d.%H%M%S").to_string()
}
