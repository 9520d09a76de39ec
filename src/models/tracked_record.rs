use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::value::{scalar_string, value_timestamp, Record};

/// The local cache entry for one trip ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedRecord {
    pub local_id: Uuid,
    /// Clearinghouse id, set once the registry knows the trip.
    pub remote_id: Option<String>,
    /// `updated_at` of the last snapshot; the high-water mark for incremental fetch.
    pub remote_updated_at: Option<DateTime<Utc>>,
    /// True when the trip was created by this provider.
    pub is_originated: bool,
    pub origin_id: Option<String>,
    /// Appointment time of the trip, paired with `origin_id` as its identity.
    pub origin_timestamp: Option<DateTime<Utc>>,
    /// Last known full remote record.
    pub snapshot: Option<Record>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrackedRecord {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            local_id: Uuid::new_v4(),
            remote_id: None,
            remote_updated_at: None,
            is_originated: false,
            origin_id: None,
            origin_timestamp: None,
            snapshot: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A trip created from an imported row, before the Clearinghouse has seen it.
    pub fn originated(origin_id: impl Into<String>, origin_timestamp: DateTime<Utc>) -> Self {
        Self {
            is_originated: true,
            origin_id: Some(origin_id.into()),
            origin_timestamp: Some(origin_timestamp),
            ..Self::new()
        }
    }

    pub fn from_remote(record: &Record) -> Self {
        let mut tracked = Self::new();
        tracked.map_remote(record);
        tracked
    }

    /// Synced records are updated remotely; unsynced ones are created.
    pub fn is_synced(&self) -> bool {
        self.remote_id.is_some()
    }

    /// Copies identity fields present in `record` and keeps it as the snapshot.
    pub fn map_remote(&mut self, record: &Record) {
        if let Some(id) = record.get("id").and_then(scalar_string) {
            self.remote_id = Some(id);
        }
        if let Some(ts) = record.get("updated_at").and_then(value_timestamp) {
            self.remote_updated_at = Some(ts);
        }
        if let Some(flag) = record.get("is_originated").and_then(as_flag) {
            self.is_originated = flag;
        }
        if let Some(origin_id) = record.get("origin_trip_id").and_then(scalar_string) {
            self.origin_id = Some(origin_id);
        }
        if let Some(ts) = record.get("appointment_time").and_then(value_timestamp) {
            self.origin_timestamp = Some(ts);
        }
        self.snapshot = Some(record.clone());
    }
}

impl Default for TrackedRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads a boolean flag the way the Clearinghouse may send it.
pub fn as_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "t" | "1" => Some(true),
            "false" | "f" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_originated_is_unsynced() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        let record = TrackedRecord::originated("T-100", ts);

        assert!(record.is_originated);
        assert!(!record.is_synced());
        assert_eq!(record.origin_id.as_deref(), Some("T-100"));
        assert_eq!(record.origin_timestamp, Some(ts));
    }

    #[test]
    fn test_map_remote() {
        let remote = json!({
            "id": 42,
            "updated_at": "2024-03-01T10:00:00Z",
            "is_originated": true,
            "origin_trip_id": 7,
            "appointment_time": "2024-03-02 08:15:00",
            "trip_claims": []
        });
        let mut record = TrackedRecord::new();
        record.map_remote(remote.as_object().unwrap());

        assert!(record.is_synced());
        assert_eq!(record.remote_id.as_deref(), Some("42"));
        assert_eq!(record.remote_updated_at, Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()));
        assert!(record.is_originated);
        assert_eq!(record.origin_id.as_deref(), Some("7"));
        assert_eq!(record.origin_timestamp, Some(Utc.with_ymd_and_hms(2024, 3, 2, 8, 15, 0).unwrap()));
        assert_eq!(record.snapshot.as_ref(), remote.as_object());
    }

    #[test]
    fn test_map_remote_keeps_absent_fields() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        let mut record = TrackedRecord::originated("T-100", ts);
        record.map_remote(json!({ "id": "9" }).as_object().unwrap());

        assert_eq!(record.remote_id.as_deref(), Some("9"));
        assert_eq!(record.origin_id.as_deref(), Some("T-100"));
        assert_eq!(record.origin_timestamp, Some(ts));
        assert!(record.is_originated);
    }
}
