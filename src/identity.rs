//! Identity resolution between Clearinghouse records and tracked records.
//!
//! Inbound records are resolved by remote id. Outbound rows are resolved by
//! (origin id, appointment time), because the provider may reuse an origin
//! id for a different trip at another time.

use chrono::{DateTime, Utc};

use crate::db::StoreTransaction;
use crate::error::StoreError;
use crate::models::{as_flag, TrackedRecord};
use crate::value::{scalar_string, value_timestamp, Record};

/// What an outbound row needs on the Clearinghouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Create,
    Update,
}

impl SyncAction {
    pub fn for_record(record: &TrackedRecord) -> Self {
        if record.is_synced() {
            SyncAction::Update
        } else {
            SyncAction::Create
        }
    }

    pub fn method(self) -> &'static str {
        match self {
            SyncAction::Create => "POST",
            SyncAction::Update => "PUT",
        }
    }
}

/// How a fetched Clearinghouse record relates to the tracked records.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMatch {
    Tracked(TrackedRecord),
    Untracked,
    /// The record's origin key already belongs to this other tracked trip.
    OriginKeyTaken(TrackedRecord),
}

/// Finds the tracked record for a fetched Clearinghouse record.
///
/// A trip this provider originated whose create response never got
/// persisted is bound back to its unsynced origin-key record. A trip whose
/// origin key is held by a different synced record is reported as
/// [`InboundMatch::OriginKeyTaken`] instead of being stored a second time.
pub async fn resolve_inbound(
    tx: &mut StoreTransaction,
    remote_id: &str,
    remote: &Record,
) -> Result<InboundMatch, StoreError> {
    let by_remote_id = tx.find_by_remote_id(remote_id).await?;

    let originated = remote.get("is_originated").and_then(as_flag).unwrap_or(false);
    let holder = match origin_key(remote).filter(|_| originated) {
        Some((origin_id, timestamp)) => tx.find_by_origin_key(&origin_id, timestamp).await?,
        None => None,
    };

    let resolved = match (by_remote_id, holder) {
        (Some(found), Some(holder)) if holder.local_id != found.local_id => InboundMatch::OriginKeyTaken(holder),
        (Some(found), _) => InboundMatch::Tracked(found),
        (None, Some(holder)) if !holder.is_synced() => InboundMatch::Tracked(holder),
        (None, Some(holder)) => InboundMatch::OriginKeyTaken(holder),
        (None, None) => InboundMatch::Untracked,
    };
    Ok(resolved)
}

/// Finds or creates the tracked record for an outbound row.
pub async fn resolve_outbound(
    tx: &mut StoreTransaction,
    origin_id: &str,
    origin_timestamp: DateTime<Utc>,
) -> Result<(TrackedRecord, SyncAction), StoreError> {
    let record = tx.find_or_create_by_origin_key(origin_id, origin_timestamp).await?;
    let action = SyncAction::for_record(&record);
    Ok((record, action))
}

/// The (origin id, appointment time) pair of a record, if both are present.
pub fn origin_key(record: &Record) -> Option<(String, DateTime<Utc>)> {
    let origin_id = record
        .get("origin_trip_id")
        .and_then(scalar_string)
        .filter(|id| !id.trim().is_empty())?;
    let timestamp = record.get("appointment_time").and_then(value_timestamp)?;
    Some((origin_id, timestamp))
}
