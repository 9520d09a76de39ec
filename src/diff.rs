//! Structural change detection between two snapshots of a nested record.
//!
//! The result is a "changes" feed, not a replica: only entries of the
//! modified record that differ from the original are reported, and every
//! nested map in the feed says whether it is new or modified. Entries that
//! exist only in the original are never reported, because the Clearinghouse
//! never signals removal and API records are not sparse.
//!
//! ```text
//! original: { people: 1, tom: { age: 20 } }
//! modified: { people: 2, tom: { age: 21 }, sally: { age: 24 } }
//! result:   modified { people: 2, tom: modified { age: 21 }, sally: new { age: 24 } }
//! ```
//!
//! Arrays whose elements are all maps carrying an `id` are compared element
//! by element, matched on `id`. Any other array is an opaque value that is
//! reported in full when it differs in content or order.

use indexmap::IndexMap;
use serde_json::Value;

use crate::value::{record_id, scalar_string, Record};

/// Marker key used when a diff is rendered with its provenance tags.
pub const NEW_TAG: &str = "_new";
/// Marker key used when a diff is rendered with its provenance tags.
pub const MODIFIED_TAG: &str = "_modified";

/// One node of a diff result.
#[derive(Debug, Clone, PartialEq)]
pub enum Diff {
    /// A changed scalar, a required-key echo, or an opaque array reported whole.
    Value(Value),
    /// A map that did not exist in the original; carried whole and untagged inside.
    New(Record),
    /// A map that existed and changed; holds only changed and required entries.
    Modified(IndexMap<String, Diff>),
    /// Changes to an id-keyed array, one entry per new or modified element.
    List(Vec<Diff>),
}

impl Diff {
    pub fn is_new(&self) -> bool {
        matches!(self, Diff::New(_))
    }

    pub fn is_modified(&self) -> bool {
        matches!(self, Diff::Modified(_))
    }

    /// Looks up a child entry of a `New` or `Modified` map.
    ///
    /// Children of a `New` map come back as `Value` or `New` nodes.
    pub fn get(&self, key: &str) -> Option<Diff> {
        match self {
            Diff::Modified(entries) => entries.get(key).cloned(),
            Diff::New(record) => record.get(key).map(|v| match v {
                Value::Object(map) => Diff::New(map.clone()),
                other => Diff::Value(other.clone()),
            }),
            _ => None,
        }
    }

    /// The elements of an id-keyed array diff.
    pub fn items(&self) -> &[Diff] {
        match self {
            Diff::List(items) => items,
            _ => &[],
        }
    }

    /// The `id` carried by a map node, as a string.
    pub fn id(&self) -> Option<String> {
        match self {
            Diff::New(record) => record.get("id").and_then(scalar_string),
            Diff::Modified(entries) => match entries.get("id") {
                Some(Diff::Value(v)) => scalar_string(v),
                _ => None,
            },
            _ => None,
        }
    }

    /// Renders the diff with `_new: true` / `_modified: true` marker keys.
    pub fn to_tagged_value(&self) -> Value {
        match self {
            Diff::Value(v) => v.clone(),
            Diff::New(record) => {
                let mut out = Record::new();
                out.insert(NEW_TAG.to_string(), Value::Bool(true));
                out.extend(record.iter().map(|(k, v)| (k.clone(), v.clone())));
                Value::Object(out)
            }
            Diff::Modified(entries) => {
                let mut out = Record::new();
                out.insert(MODIFIED_TAG.to_string(), Value::Bool(true));
                out.extend(entries.iter().map(|(k, d)| (k.clone(), d.to_tagged_value())));
                Value::Object(out)
            }
            Diff::List(items) => Value::Array(items.iter().map(Diff::to_tagged_value).collect()),
        }
    }
}

/// Compares two snapshots of a record.
///
/// Returns `None` when `modified` is absent or empty, or when nothing
/// changed. Keys in `required_keys` are echoed into a `Modified` result even
/// when unchanged, but an echo alone never makes the result non-absent.
/// Required keys apply to this level only; nested maps are diffed without
/// them, while elements of id-keyed arrays always require `id`.
pub fn diff(original: Option<&Record>, modified: Option<&Record>, required_keys: &[&str]) -> Option<Diff> {
    let modified = modified.filter(|m| !m.is_empty())?;
    let original = match original.filter(|o| !o.is_empty()) {
        Some(original) => original,
        None => return Some(Diff::New(modified.clone())),
    };

    let mut entries = IndexMap::new();
    let mut changed = false;

    for (key, mod_value) in modified {
        let orig_value = original.get(key);
        match mod_value {
            Value::Object(mod_map) => {
                if let Some(child) = diff(orig_value.and_then(Value::as_object), Some(mod_map), &[]) {
                    changed = true;
                    entries.insert(key.clone(), child);
                }
            }
            Value::Array(mod_items) => {
                if let Some(child) = diff_arrays(orig_value.and_then(Value::as_array), mod_items) {
                    changed = true;
                    entries.insert(key.clone(), child);
                }
            }
            scalar => {
                let differs = orig_value.unwrap_or(&Value::Null) != scalar;
                changed |= differs;
                if differs || required_keys.contains(&key.as_str()) {
                    entries.insert(key.clone(), Diff::Value(scalar.clone()));
                }
            }
        }
    }

    if changed {
        Some(Diff::Modified(entries))
    } else {
        None
    }
}

/// Compares two versions of an array value.
pub fn diff_arrays(original: Option<&Vec<Value>>, modified: &[Value]) -> Option<Diff> {
    if modified.is_empty() {
        return None;
    }

    let identified = modified
        .iter()
        .all(|item| item.as_object().and_then(record_id).is_some());

    if !identified {
        let unchanged = original.map(|o| o.as_slice() == modified).unwrap_or(false);
        return if unchanged {
            None
        } else {
            Some(Diff::Value(Value::Array(modified.to_vec())))
        };
    }

    let empty = Vec::new();
    let original = original.unwrap_or(&empty);
    let items: Vec<Diff> = modified
        .iter()
        .filter_map(Value::as_object)
        .filter_map(|mod_item| {
            let id = record_id(mod_item);
            let orig_item = original
                .iter()
                .filter_map(Value::as_object)
                .find(|orig| record_id(orig).is_some() && record_id(orig) == id);
            diff(orig_item, Some(mod_item), &["id"])
        })
        .collect();

    if items.is_empty() {
        None
    } else {
        Some(Diff::List(items))
    }
}

/// Strips provenance tags, leaving the plain change payload.
pub fn clean(diff: &Diff) -> Value {
    match diff {
        Diff::Value(v) => v.clone(),
        Diff::New(record) => Value::Object(record.clone()),
        Diff::Modified(entries) => {
            Value::Object(entries.iter().map(|(k, d)| (k.clone(), clean(d))).collect())
        }
        Diff::List(items) => Value::Array(items.iter().map(clean).collect()),
    }
}
