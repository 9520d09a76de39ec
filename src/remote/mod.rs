//! The Clearinghouse API seam.
//!
//! The sync cycle talks to the registry only through [`RemoteClient`], so
//! the HTTP client here can be swapped for an in-memory double in tests.

mod http;
mod signing;

pub use http::HttpRemoteClient;
pub use signing::RequestSigner;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::RemoteError;
use crate::value::{record_id, Record};

/// Request/response access to the Clearinghouse.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn get(&self, path: &str, query: &Record) -> Result<RemoteResponse, RemoteError>;

    async fn post(&self, path: &str, body: &Record) -> Result<RemoteRecord, RemoteError>;

    async fn put(&self, path: &str, body: &Record) -> Result<RemoteRecord, RemoteError>;
}

/// One record returned by the API, with the resource path it lives at.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    pub path: String,
    pub attributes: Record,
}

impl RemoteRecord {
    /// Builds a record from a response to `request_path`.
    ///
    /// The record's own path drops a trailing custom action (`trip_tickets/sync`)
    /// and ends with the record id when it has one.
    pub fn new(request_path: &str, attributes: Record) -> Self {
        let base = resource_base(request_path);
        let path = match record_id(&attributes) {
            Some(id) if base.rsplit('/').next() != Some(id.as_str()) => format!("{}/{}", base, id),
            _ => base,
        };
        Self { path, attributes }
    }

    pub fn id(&self) -> Option<String> {
        record_id(&self.attributes)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Fetches a named sub-resource of this record, e.g. `trip_ticket_comments`.
    pub async fn fetch(&self, client: &dyn RemoteClient, name: &str) -> Result<RemoteResponse, RemoteError> {
        client.get(&format!("{}/{}", self.path, name), &Record::new()).await
    }

    pub fn into_attributes(self) -> Record {
        self.attributes
    }
}

/// A GET response: a single record or a collection.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteResponse {
    One(RemoteRecord),
    Many(Vec<RemoteRecord>),
}

impl RemoteResponse {
    /// Interprets a decoded JSON body returned for `path`.
    pub fn from_json(path: &str, body: Value) -> Result<Self, RemoteError> {
        match body {
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Object(attributes) => Ok(RemoteRecord::new(path, attributes)),
                    other => Err(RemoteError::InvalidResponse {
                        path: path.to_string(),
                        reason: format!("expected an object in the result list, got {}", other),
                    }),
                })
                .collect::<Result<_, _>>()
                .map(RemoteResponse::Many),
            Value::Object(attributes) => Ok(RemoteResponse::One(RemoteRecord::new(path, attributes))),
            other => Err(RemoteError::InvalidResponse {
                path: path.to_string(),
                reason: format!("expected an object or a list, got {}", other),
            }),
        }
    }

    pub fn into_records(self) -> Vec<RemoteRecord> {
        match self {
            RemoteResponse::One(record) => vec![record],
            RemoteResponse::Many(records) => records,
        }
    }
}

fn is_name_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphabetic() || c == '_' || c == '-')
}

/// Drops a trailing custom action segment: `trip_tickets/sync` becomes `trip_tickets`.
fn resource_base(path: &str) -> String {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match segments.as_slice() {
        [.., parent, last] if is_name_segment(parent) && is_name_segment(last) => {
            segments[..segments.len() - 1].join("/")
        }
        _ => segments.join("/"),
    }
}

/// Singular name of the resource addressed by `path`.
///
/// `trip_tickets/1/trip_ticket_comments/2` is a `trip_ticket_comment`, and a
/// trailing custom action is skipped, so `trip_tickets/sync` is a `trip_ticket`.
pub fn singular_resource_name(path: &str) -> Option<String> {
    let segments: Vec<&str> = path
        .trim_matches('/')
        .split('/')
        .collect();
    let end = segments.iter().rposition(|s| is_name_segment(s))?;
    let name = match end.checked_sub(1).map(|i| segments[i]) {
        Some(parent) if is_name_segment(parent) => parent,
        _ => segments[end],
    };
    Some(singularize(name))
}

fn singularize(name: &str) -> String {
    if let Some(stem) = name.strip_suffix("ies") {
        format!("{}y", stem)
    } else if let Some(stem) = name.strip_suffix('s').filter(|s| !s.ends_with('s')) {
        stem.to_string()
    } else {
        name.to_string()
    }
}
