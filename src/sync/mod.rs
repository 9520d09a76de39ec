//! One reconciliation cycle between the Clearinghouse and the provider.
//!
//! A cycle moves through `FetchRemote → Reconcile → Export → Import` and
//! then commits. Every local write of the cycle happens inside a single
//! store transaction, so a failure in any phase leaves the store exactly as
//! it was before the cycle started. Calls already made to the
//! Clearinghouse cannot be undone.
//!
//! Errors that only affect one record (a trip without an id, a rejected
//! POST) are collected and reported in one notification per phase.

use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::db::{LocalStore, StoreTransaction};
use crate::diff::{diff, Diff};
use crate::error::SyncError;
use crate::identity::{origin_key, resolve_inbound, resolve_outbound, InboundMatch, SyncAction};
use crate::models::{CollectionKind, TrackedRecord};
use crate::notify::{notify_best_effort, Notifier};
use crate::processors::{Exporter, ImportRow, Importer};
use crate::remote::RemoteClient;
use crate::value::{is_blank, record_id, scalar_string, Record};

/// Incremental fetch endpoint.
pub const SYNC_PATH: &str = "trip_tickets/sync";
/// Collection endpoint for creates; updates go to `trip_tickets/<id>`.
pub const TRIP_TICKETS_PATH: &str = "trip_tickets";
/// Export tag set on trips and nested records.
pub const NEW_RECORD_KEY: &str = "new_record";

const UPDATED_SINCE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    FetchRemote,
    Reconcile,
    Export,
    Import,
    Commit,
    Rollback,
}

impl CyclePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            CyclePhase::Idle => "idle",
            CyclePhase::FetchRemote => "fetch",
            CyclePhase::Reconcile => "reconcile",
            CyclePhase::Export => "export",
            CyclePhase::Import => "import",
            CyclePhase::Commit => "commit",
            CyclePhase::Rollback => "rollback",
        }
    }
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a completed cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// Records returned by the incremental fetch.
    pub fetched: usize,
    /// Fetched records that had an id and were stored.
    pub reconciled: usize,
    /// Entries handed to the exporter.
    pub exported: usize,
    pub imported: usize,
    pub skipped: usize,
    pub unposted: usize,
    /// Every per-record error of the cycle, in the order they occurred.
    pub errors: Vec<String>,
}

/// Where an import row ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowOutcome {
    Imported,
    Skipped,
    Unposted,
}

/// Drives reconciliation cycles against one store and one Clearinghouse.
///
/// Import and export run only when a processor is attached.
pub struct SyncCycle<'a> {
    store: &'a LocalStore,
    remote: &'a dyn RemoteClient,
    notifier: &'a dyn Notifier,
    importer: Option<&'a mut dyn Importer>,
    exporter: Option<&'a mut dyn Exporter>,
    phase: CyclePhase,
}

impl<'a> SyncCycle<'a> {
    pub fn new(store: &'a LocalStore, remote: &'a dyn RemoteClient, notifier: &'a dyn Notifier) -> Self {
        Self {
            store,
            remote,
            notifier,
            importer: None,
            exporter: None,
            phase: CyclePhase::Idle,
        }
    }

    pub fn with_importer(mut self, importer: &'a mut dyn Importer) -> Self {
        self.importer = Some(importer);
        self
    }

    pub fn with_exporter(mut self, exporter: &'a mut dyn Exporter) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// The phase the last cycle reached.
    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    /// Runs one full cycle.
    ///
    /// On failure every local write of the cycle is rolled back, one
    /// notification is sent and the error is returned.
    pub async fn poll(&mut self) -> Result<CycleReport, SyncError> {
        self.phase = CyclePhase::Idle;
        let mut report = CycleReport::default();

        let outcome = match self.store.begin().await {
            Ok(mut tx) => match self.run(&mut tx, &mut report).await {
                Ok(()) => {
                    self.phase = CyclePhase::Commit;
                    let committed = tx.commit().await.map_err(SyncError::from);
                    if let Some(importer) = self.importer.as_deref_mut() {
                        match &committed {
                            Ok(()) => importer.committed(),
                            Err(_) => importer.rolled_back(),
                        }
                    }
                    committed
                }
                Err(e) => {
                    let failed = self.phase;
                    self.phase = CyclePhase::Rollback;
                    if let Err(rollback) = tx.rollback().await {
                        tracing::error!(error = %rollback, "Failed to roll back sync cycle");
                    }
                    if let Some(importer) = self.importer.as_deref_mut() {
                        importer.rolled_back();
                    }
                    self.phase = failed;
                    Err(e)
                }
            },
            Err(e) => Err(SyncError::from(e)),
        };

        match outcome {
            Ok(()) => {
                tracing::info!(
                    fetched = report.fetched,
                    exported = report.exported,
                    imported = report.imported,
                    skipped = report.skipped,
                    unposted = report.unposted,
                    errors = report.errors.len(),
                    "Sync cycle complete"
                );
                self.phase = CyclePhase::Idle;
                Ok(report)
            }
            Err(e) => {
                tracing::error!(phase = %self.phase, error = %e, "Sync cycle failed");
                let message = format!("Sync cycle failed during {}: {}", self.phase, e);
                notify_best_effort(self.notifier, &message).await;
                Err(e)
            }
        }
    }

    async fn run(&mut self, tx: &mut StoreTransaction, report: &mut CycleReport) -> Result<(), SyncError> {
        self.phase = CyclePhase::FetchRemote;
        let fetched = self.fetch_remote(tx).await?;
        report.fetched = fetched.len();

        self.phase = CyclePhase::Reconcile;
        let mut errors = Vec::new();
        let mut batch = Vec::new();
        for record in fetched {
            if record_id(&record).is_none() {
                errors.push("A trip ticket from the Clearinghouse was missing its ID".to_string());
                continue;
            }
            match reconcile_record(tx, record).await? {
                Reconciled::Stored(entry) => {
                    report.reconciled += 1;
                    batch.extend(entry);
                }
                Reconciled::Conflict(message) => errors.push(message),
            }
        }
        tracing::info!(reconciled = report.reconciled, changed = batch.len(), "Reconciled Clearinghouse trips");
        self.report_errors(&errors).await;
        report.errors.append(&mut errors);

        self.phase = CyclePhase::Export;
        if let Some(exporter) = self.exporter.as_deref_mut() {
            exporter.process(&batch)?;
            report.exported = batch.len();
            errors.extend(exporter.take_errors());
        }
        self.report_errors(&errors).await;
        report.errors.append(&mut errors);

        self.phase = CyclePhase::Import;
        if self.importer.is_some() {
            self.import(tx, report, &mut errors).await?;
            self.report_errors(&errors).await;
            report.errors.append(&mut errors);
        }

        Ok(())
    }

    async fn fetch_remote(&self, tx: &mut StoreTransaction) -> Result<Vec<Record>, SyncError> {
        let mut query = Record::new();
        if let Some(since) = tx.max_remote_updated_at().await? {
            query.insert("updated_since".to_string(), Value::String(updated_since(since)));
        }

        let response = self
            .remote
            .get(SYNC_PATH, &query)
            .await
            .map_err(|source| SyncError::Remote {
                phase: "GET trip_tickets/sync",
                source,
            })?;

        let records: Vec<Record> = response.into_records().into_iter().map(|r| r.into_attributes()).collect();
        tracing::info!(count = records.len(), "Retrieved updated trips from the Clearinghouse");
        Ok(records)
    }

    async fn import(
        &mut self,
        tx: &mut StoreTransaction,
        report: &mut CycleReport,
        errors: &mut Vec<String>,
    ) -> Result<(), SyncError> {
        let remote = self.remote;
        let Some(importer) = self.importer.as_deref_mut() else {
            return Ok(());
        };

        let rows = importer.process(tx).await?;
        errors.extend(importer.take_errors());
        tracing::info!(rows = rows.len(), "Importing rows");

        let (mut imported, mut skipped, mut unposted) = (Vec::new(), Vec::new(), Vec::new());
        for row in rows {
            match import_row(tx, remote, &row, errors).await? {
                RowOutcome::Imported => imported.push(row),
                RowOutcome::Skipped => skipped.push(row),
                RowOutcome::Unposted => unposted.push(row),
            }
        }

        importer.finalize(tx, &imported, &skipped, &unposted).await?;
        errors.extend(importer.take_errors());

        report.imported = imported.len();
        report.skipped = skipped.len();
        report.unposted = unposted.len();
        Ok(())
    }

    async fn report_errors(&self, errors: &[String]) {
        if errors.is_empty() {
            return;
        }
        let message = format!(
            "Encountered {} errors while syncing with the Ride Clearinghouse:\n{}",
            errors.len(),
            errors.join("\n")
        );
        notify_best_effort(self.notifier, &message).await;
    }
}

/// `updated_since` filter value for a high-water mark.
pub fn updated_since(since: DateTime<Utc>) -> String {
    since.format(UPDATED_SINCE_FORMAT).to_string()
}

/// What reconciling one fetched trip produced.
#[derive(Debug, Clone, PartialEq)]
enum Reconciled {
    /// The trip was stored; the entry is `None` when nothing changed.
    Stored(Option<Record>),
    /// The trip was not stored.
    Conflict(String),
}

/// Stores a fetched trip and returns its export entry, if there is anything to export.
///
/// A tracked trip whose snapshot diff is empty is stored but not exported:
/// the export batch is a changes feed, so only new and modified trips go out.
async fn reconcile_record(tx: &mut StoreTransaction, mut record: Record) -> Result<Reconciled, SyncError> {
    let Some(remote_id) = record_id(&record) else {
        return Ok(Reconciled::Stored(None));
    };

    for kind in CollectionKind::NESTED {
        if let Some(key) = kind.record_key() {
            if record.get(key).map_or(true, Value::is_null) {
                record.insert(key.to_string(), kind.empty_value());
            }
        }
    }

    let (mut tracked, previous) = match resolve_inbound(tx, &remote_id, &record).await? {
        InboundMatch::Tracked(mut tracked) => {
            let previous = tracked.snapshot.take();
            (tracked, previous)
        }
        InboundMatch::Untracked => (TrackedRecord::new(), None),
        InboundMatch::OriginKeyTaken(holder) => {
            let holder_id = holder.remote_id.unwrap_or_else(|| holder.local_id.to_string());
            tracing::warn!(remote_id = %remote_id, holder = %holder_id, "Origin key already tracked");
            return Ok(Reconciled::Conflict(format!(
                "Trip ticket {} from the Clearinghouse has the same origin_trip_id and appointment_time as trip ticket {}",
                remote_id, holder_id
            )));
        }
    };

    let entry = match &previous {
        None => Some(tag_new(&record)),
        Some(previous) => {
            diff(Some(previous), Some(&record), &["id"]).map(|changes| tag_changes(&record, previous, &changes))
        }
    };

    tracked.map_remote(&record);
    tx.save(&tracked).await?;
    Ok(Reconciled::Stored(entry))
}

/// A trip seen for the first time: it and everything under it is new.
fn tag_new(record: &Record) -> Record {
    let mut entry = record.clone();
    entry.insert(NEW_RECORD_KEY.to_string(), Value::Bool(true));
    for kind in CollectionKind::NESTED {
        let Some(key) = kind.record_key() else { continue };
        match entry.get_mut(key) {
            Some(Value::Array(items)) => {
                for item in items.iter_mut().filter_map(Value::as_object_mut) {
                    item.insert(NEW_RECORD_KEY.to_string(), Value::Bool(true));
                }
            }
            Some(Value::Object(nested)) if !nested.is_empty() => {
                nested.insert(NEW_RECORD_KEY.to_string(), Value::Bool(true));
            }
            _ => {}
        }
    }
    entry
}

/// A tracked trip that changed: nested records are new only if the diff says so.
///
/// Elements of an id-keyed collection take their tag from the `New` nodes of
/// the diff. A collection without ids diffs as one opaque value, so its
/// elements are new when the previous snapshot did not contain them.
fn tag_changes(record: &Record, previous: &Record, changes: &Diff) -> Record {
    let mut entry = record.clone();
    entry.insert(NEW_RECORD_KEY.to_string(), Value::Bool(false));
    for kind in CollectionKind::NESTED {
        let Some(key) = kind.record_key() else { continue };
        let change = changes.get(key);
        match entry.get_mut(key) {
            Some(Value::Array(items)) => {
                let new_ids: Vec<String> = match &change {
                    Some(Diff::List(diffs)) => diffs.iter().filter(|d| d.is_new()).filter_map(Diff::id).collect(),
                    _ => Vec::new(),
                };
                let seen: &[Value] = match (&change, previous.get(key)) {
                    (Some(Diff::Value(_)), Some(Value::Array(before))) => before,
                    _ => &[],
                };
                for item in items.iter_mut() {
                    let is_new = match &change {
                        Some(Diff::List(_)) => item
                            .as_object()
                            .and_then(record_id)
                            .is_some_and(|id| new_ids.contains(&id)),
                        Some(Diff::Value(_)) => !seen.contains(item),
                        _ => false,
                    };
                    if let Some(item) = item.as_object_mut() {
                        item.insert(NEW_RECORD_KEY.to_string(), Value::Bool(is_new));
                    }
                }
            }
            Some(Value::Object(nested)) if !nested.is_empty() => {
                let is_new = change.as_ref().is_some_and(Diff::is_new);
                nested.insert(NEW_RECORD_KEY.to_string(), Value::Bool(is_new));
            }
            _ => {}
        }
    }
    entry
}

/// Pushes one provider row to the Clearinghouse.
async fn import_row(
    tx: &mut StoreTransaction,
    remote: &dyn RemoteClient,
    row: &ImportRow,
    errors: &mut Vec<String>,
) -> Result<RowOutcome, SyncError> {
    let has_origin_id = row
        .data
        .get("origin_trip_id")
        .filter(|v| !is_blank(v))
        .and_then(scalar_string)
        .is_some();
    if !has_origin_id {
        errors.push("Imported row does not contain an origin_trip_id value".to_string());
        return Ok(RowOutcome::Skipped);
    }
    let Some((origin_id, appointment_time)) = origin_key(&row.data) else {
        errors.push("Imported row does not contain a valid appointment_time value".to_string());
        return Ok(RowOutcome::Skipped);
    };

    let (mut tracked, action) = resolve_outbound(tx, &origin_id, appointment_time).await?;
    let result = match (action, tracked.remote_id.as_deref()) {
        (SyncAction::Update, Some(remote_id)) => {
            remote
                .put(&format!("{}/{}", TRIP_TICKETS_PATH, remote_id), &row.data)
                .await
        }
        _ => remote.post(TRIP_TICKETS_PATH, &row.data).await,
    };
    tracing::info!(origin_trip_id = %origin_id, method = action.method(), ok = result.is_ok(), "Pushed trip ticket");

    match result {
        Err(e) => {
            errors.push(format!("API error on {}: {}", action.method(), e));
            Ok(RowOutcome::Unposted)
        }
        Ok(response) if response.id().is_none() => {
            errors.push("API result does not contain an ID".to_string());
            Ok(RowOutcome::Unposted)
        }
        Ok(response) => {
            tracked.map_remote(&response.attributes);
            tx.save(&tracked).await?;
            Ok(RowOutcome::Imported)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{NotifyError, ProcessorError, RemoteError};
    use crate::remote::{RemoteRecord, RemoteResponse};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn rec(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[derive(Default)]
    struct FakeRemote {
        trips: Mutex<Vec<Record>>,
        queries: Mutex<Vec<Record>>,
        posts: Mutex<Vec<Record>>,
        puts: Mutex<Vec<String>>,
        fail_fetch: bool,
        fail_post: bool,
        omit_id: bool,
    }

    impl FakeRemote {
        fn with_trips(trips: Vec<Value>) -> Self {
            let fake = Self::default();
            *fake.trips.lock().unwrap() = trips.into_iter().map(rec).collect();
            fake
        }

        fn set_trips(&self, trips: Vec<Value>) {
            *self.trips.lock().unwrap() = trips.into_iter().map(rec).collect();
        }

        fn respond(&self, path: &str, id: u64, body: &Record) -> RemoteRecord {
            let mut attributes = body.clone();
            if !self.omit_id {
                attributes.insert("id".to_string(), json!(id));
            }
            attributes.insert("updated_at".to_string(), json!("2024-03-02T08:00:00Z"));
            RemoteRecord::new(path, attributes)
        }
    }

    #[async_trait]
    impl RemoteClient for FakeRemote {
        async fn get(&self, _path: &str, query: &Record) -> Result<RemoteResponse, RemoteError> {
            self.queries.lock().unwrap().push(query.clone());
            if self.fail_fetch {
                return Err(RemoteError::InvalidResponse {
                    path: SYNC_PATH.to_string(),
                    reason: "offline".to_string(),
                });
            }
            let trips = self.trips.lock().unwrap().clone();
            Ok(RemoteResponse::Many(
                trips.into_iter().map(|t| RemoteRecord::new(SYNC_PATH, t)).collect(),
            ))
        }

        async fn post(&self, path: &str, body: &Record) -> Result<RemoteRecord, RemoteError> {
            if self.fail_post {
                return Err(RemoteError::Status {
                    method: "POST",
                    path: path.to_string(),
                    status: 422,
                    body: "invalid".to_string(),
                });
            }
            let mut posts = self.posts.lock().unwrap();
            posts.push(body.clone());
            Ok(self.respond(path, 100 + posts.len() as u64, body))
        }

        async fn put(&self, path: &str, body: &Record) -> Result<RemoteRecord, RemoteError> {
            self.puts.lock().unwrap().push(path.to_string());
            let id = path.rsplit('/').next().and_then(|id| id.parse().ok()).unwrap_or(0);
            Ok(self.respond(path, id, body))
        }
    }

    #[derive(Default)]
    struct FakeNotifier {
        messages: Mutex<Vec<String>>,
    }

    impl FakeNotifier {
        fn messages(&self) -> Vec<String> {
            self.messages.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for FakeNotifier {
        async fn send(&self, message: &str) -> Result<(), NotifyError> {
            self.messages.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeExporter {
        batches: Vec<Vec<Record>>,
        errors: Vec<String>,
    }

    impl Exporter for FakeExporter {
        fn process(&mut self, batch: &[Record]) -> Result<(), ProcessorError> {
            self.batches.push(batch.to_vec());
            Ok(())
        }

        fn take_errors(&mut self) -> Vec<String> {
            std::mem::take(&mut self.errors)
        }
    }

    #[derive(Default)]
    struct FakeImporter {
        rows: Vec<Record>,
        fail: bool,
        fail_finalize: bool,
        finalized: Option<(usize, usize, usize)>,
        commits: usize,
        rollbacks: usize,
    }

    #[async_trait]
    impl Importer for FakeImporter {
        async fn process(&mut self, _tx: &mut StoreTransaction) -> Result<Vec<ImportRow>, ProcessorError> {
            if self.fail {
                return Err(ProcessorError::NotConfigured("import folder vanished".to_string()));
            }
            Ok(self.rows.iter().cloned().map(ImportRow::new).collect())
        }

        async fn finalize(
            &mut self,
            _tx: &mut StoreTransaction,
            imported: &[ImportRow],
            skipped: &[ImportRow],
            unposted: &[ImportRow],
        ) -> Result<(), ProcessorError> {
            self.finalized = Some((imported.len(), skipped.len(), unposted.len()));
            if self.fail_finalize {
                return Err(ProcessorError::NotConfigured("completed folder vanished".to_string()));
            }
            Ok(())
        }

        fn take_errors(&mut self) -> Vec<String> {
            Vec::new()
        }

        fn committed(&mut self) {
            self.commits += 1;
        }

        fn rolled_back(&mut self) {
            self.rollbacks += 1;
        }
    }

    async fn setup() -> (LocalStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::open(&temp_dir.path().join("test.db")).await.unwrap();
        (store, temp_dir)
    }

    fn trip(claims: Value) -> Value {
        json!({
            "id": 1,
            "updated_at": "2024-03-01T10:00:00Z",
            "origin_trip_id": "A-1",
            "appointment_time": "2024-03-05T09:00:00Z",
            "customer_first_name": "Sally",
            "trip_claims": claims
        })
    }

    #[tokio::test]
    async fn test_new_trip_is_tracked_and_tagged_new() {
        let (store, _dir) = setup().await;
        let remote = FakeRemote::with_trips(vec![trip(json!([{ "id": 9, "status": "pending" }]))]);
        let notifier = FakeNotifier::default();
        let mut exporter = FakeExporter::default();

        let report = SyncCycle::new(&store, &remote, &notifier)
            .with_exporter(&mut exporter)
            .poll()
            .await
            .unwrap();

        assert_eq!(report.fetched, 1);
        assert_eq!(report.exported, 1);
        assert_eq!(store.tracked_count().await.unwrap(), 1);
        assert!(remote.queries.lock().unwrap()[0].is_empty());

        let entry = &exporter.batches[0][0];
        assert_eq!(entry.get("new_record"), Some(&json!(true)));
        assert_eq!(entry["trip_claims"][0]["new_record"], json!(true));
        // Missing sub-collections default to empty containers
        assert_eq!(entry.get("trip_ticket_comments"), Some(&json!([])));
        assert_eq!(entry.get("trip_result"), Some(&json!({})));
        assert!(notifier.messages().is_empty());
    }

    #[tokio::test]
    async fn test_unchanged_second_run_exports_empty_batch() {
        let (store, _dir) = setup().await;
        let remote = FakeRemote::with_trips(vec![trip(json!([]))]);
        let notifier = FakeNotifier::default();
        let mut exporter = FakeExporter::default();

        for _ in 0..2 {
            SyncCycle::new(&store, &remote, &notifier)
                .with_exporter(&mut exporter)
                .poll()
                .await
                .unwrap();
        }

        assert_eq!(exporter.batches.len(), 2);
        assert_eq!(exporter.batches[0].len(), 1);
        assert!(exporter.batches[1].is_empty());
        assert_eq!(
            remote.queries.lock().unwrap()[1].get("updated_since"),
            Some(&json!("2024-03-01 10:00:00.000000"))
        );
        assert_eq!(store.tracked_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_modified_trip_tags_only_new_claims() {
        let (store, _dir) = setup().await;
        let remote = FakeRemote::with_trips(vec![trip(json!([{ "id": 9, "status": "pending" }]))]);
        let notifier = FakeNotifier::default();
        let mut exporter = FakeExporter::default();

        SyncCycle::new(&store, &remote, &notifier)
            .with_exporter(&mut exporter)
            .poll()
            .await
            .unwrap();

        remote.set_trips(vec![trip(json!([
            { "id": 9, "status": "approved" },
            { "id": 10, "status": "pending" }
        ]))]);
        SyncCycle::new(&store, &remote, &notifier)
            .with_exporter(&mut exporter)
            .poll()
            .await
            .unwrap();

        let entry = &exporter.batches[1][0];
        assert_eq!(entry.get("new_record"), Some(&json!(false)));
        assert_eq!(entry["trip_claims"][0]["new_record"], json!(false));
        assert_eq!(entry["trip_claims"][1]["new_record"], json!(true));
        assert_eq!(store.tracked_count().await.unwrap(), 1);

        let tracked = store.find_by_remote_id("1").await.unwrap().unwrap();
        assert_eq!(tracked.snapshot.unwrap()["trip_claims"][0]["status"], json!("approved"));
    }

    #[tokio::test]
    async fn test_trip_without_id_is_reported_and_dropped() {
        let (store, _dir) = setup().await;
        let remote = FakeRemote::with_trips(vec![json!({ "customer_first_name": "Nobody" }), trip(json!([]))]);
        let notifier = FakeNotifier::default();
        let mut exporter = FakeExporter::default();

        let report = SyncCycle::new(&store, &remote, &notifier)
            .with_exporter(&mut exporter)
            .poll()
            .await
            .unwrap();

        assert_eq!(report.fetched, 2);
        assert_eq!(report.reconciled, 1);
        assert_eq!(exporter.batches[0].len(), 1);
        assert_eq!(store.tracked_count().await.unwrap(), 1);
        let messages = notifier.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("Encountered 1 errors while syncing with the Ride Clearinghouse:"));
        assert!(messages[0].contains("missing its ID"));
    }

    #[tokio::test]
    async fn test_fetch_failure_aborts_cycle() {
        let (store, _dir) = setup().await;
        let remote = FakeRemote {
            fail_fetch: true,
            ..FakeRemote::default()
        };
        let notifier = FakeNotifier::default();

        let mut cycle = SyncCycle::new(&store, &remote, &notifier);
        let result = cycle.poll().await;

        assert!(matches!(result, Err(SyncError::Remote { .. })));
        assert_eq!(cycle.phase(), CyclePhase::FetchRemote);
        let messages = notifier.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("Sync cycle failed during fetch"));
    }

    #[tokio::test]
    async fn test_import_failure_rolls_back_everything() {
        let (store, _dir) = setup().await;
        let remote = FakeRemote::with_trips(vec![trip(json!([]))]);
        let notifier = FakeNotifier::default();
        let mut importer = FakeImporter {
            fail: true,
            ..FakeImporter::default()
        };

        let result = SyncCycle::new(&store, &remote, &notifier)
            .with_importer(&mut importer)
            .poll()
            .await;

        assert!(matches!(result, Err(SyncError::Processor(_))));
        assert_eq!(store.tracked_count().await.unwrap(), 0);
        let messages = notifier.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("during import"));
    }

    #[tokio::test]
    async fn test_id_less_comments_tagged_by_previous_snapshot() {
        let (store, _dir) = setup().await;
        let with_comments = |comments: Value| {
            json!({
                "id": 1,
                "updated_at": "2024-03-01T10:00:00Z",
                "trip_ticket_comments": comments
            })
        };
        let remote = FakeRemote::with_trips(vec![with_comments(json!([{ "body": "On the way" }]))]);
        let notifier = FakeNotifier::default();
        let mut exporter = FakeExporter::default();

        SyncCycle::new(&store, &remote, &notifier)
            .with_exporter(&mut exporter)
            .poll()
            .await
            .unwrap();

        remote.set_trips(vec![with_comments(json!([{ "body": "On the way" }, { "body": "Arrived" }]))]);
        SyncCycle::new(&store, &remote, &notifier)
            .with_exporter(&mut exporter)
            .poll()
            .await
            .unwrap();

        let comments = &exporter.batches[1][0]["trip_ticket_comments"];
        assert_eq!(comments[0]["new_record"], json!(false));
        assert_eq!(comments[1]["new_record"], json!(true));
        assert_eq!(comments[1]["body"], json!("Arrived"));
    }

    #[tokio::test]
    async fn test_reconcile_and_export_errors_notify_separately() {
        let (store, _dir) = setup().await;
        let remote = FakeRemote::with_trips(vec![json!({ "customer_first_name": "Nobody" }), trip(json!([]))]);
        let notifier = FakeNotifier::default();
        let mut exporter = FakeExporter {
            errors: vec!["Failed to export trip_claims: disk full".to_string()],
            ..FakeExporter::default()
        };

        let report = SyncCycle::new(&store, &remote, &notifier)
            .with_exporter(&mut exporter)
            .poll()
            .await
            .unwrap();

        assert_eq!(report.errors.len(), 2);
        let messages = notifier.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].starts_with("Encountered 1 errors"));
        assert!(messages[0].contains("missing its ID"));
        assert!(messages[1].starts_with("Encountered 1 errors"));
        assert!(messages[1].contains("disk full"));
    }

    #[tokio::test]
    async fn test_origin_key_taken_by_synced_trip_is_reported_not_fatal() {
        let (store, _dir) = setup().await;
        let remote = FakeRemote::default();
        let notifier = FakeNotifier::default();
        let mut importer = FakeImporter {
            rows: vec![rec(json!({ "origin_trip_id": "T-1", "appointment_time": "2024-03-05 09:00:00" }))],
            ..FakeImporter::default()
        };

        SyncCycle::new(&store, &remote, &notifier)
            .with_importer(&mut importer)
            .poll()
            .await
            .unwrap();
        assert!(store.find_by_remote_id("101").await.unwrap().is_some());

        remote.set_trips(vec![json!({
            "id": 555,
            "updated_at": "2024-03-03T08:00:00Z",
            "is_originated": true,
            "origin_trip_id": "T-1",
            "appointment_time": "2024-03-05T09:00:00Z"
        })]);
        for _ in 0..2 {
            let report = SyncCycle::new(&store, &remote, &notifier).poll().await.unwrap();
            assert_eq!(report.reconciled, 0);
            assert_eq!(report.errors.len(), 1);
            assert!(report.errors[0].contains("trip ticket 101"));
        }

        assert_eq!(store.tracked_count().await.unwrap(), 1);
        assert!(store.find_by_remote_id("555").await.unwrap().is_none());
        let messages = notifier.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| !m.contains("Sync cycle failed")));
    }

    #[tokio::test]
    async fn test_failed_finalize_rolls_back_saved_rows() {
        let (store, _dir) = setup().await;
        let remote = FakeRemote::with_trips(vec![trip(json!([]))]);
        let notifier = FakeNotifier::default();

        SyncCycle::new(&store, &remote, &notifier).poll().await.unwrap();
        let count_before = store.tracked_count().await.unwrap();
        let since_before = store.max_remote_updated_at().await.unwrap();
        assert_eq!(count_before, 1);

        remote.set_trips(vec![json!({
            "id": 1,
            "updated_at": "2024-03-01T12:00:00Z",
            "customer_first_name": "Sam"
        })]);
        let mut importer = FakeImporter {
            rows: vec![rec(json!({ "origin_trip_id": "T-9", "appointment_time": "2024-03-05 09:00:00" }))],
            fail_finalize: true,
            ..FakeImporter::default()
        };

        let result = SyncCycle::new(&store, &remote, &notifier)
            .with_importer(&mut importer)
            .poll()
            .await;

        assert!(matches!(result, Err(SyncError::Processor(_))));
        // The row reached the Clearinghouse and was saved before finalize failed
        assert_eq!(remote.posts.lock().unwrap().len(), 1);
        assert_eq!(importer.finalized, Some((1, 0, 0)));
        assert_eq!((importer.commits, importer.rollbacks), (0, 1));

        assert_eq!(store.tracked_count().await.unwrap(), count_before);
        assert_eq!(store.max_remote_updated_at().await.unwrap(), since_before);
        assert!(store.find_by_remote_id("101").await.unwrap().is_none());
        let tracked = store.find_by_remote_id("1").await.unwrap().unwrap();
        assert_eq!(tracked.snapshot.unwrap()["customer_first_name"], json!("Sally"));

        let messages = notifier.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("during import"));
    }

    #[tokio::test]
    async fn test_import_creates_then_updates_by_origin_key() {
        let (store, _dir) = setup().await;
        let remote = FakeRemote::default();
        let notifier = FakeNotifier::default();
        let mut importer = FakeImporter {
            rows: vec![
                rec(json!({ "origin_trip_id": "T-1", "appointment_time": "2024-03-05 09:00:00" })),
                rec(json!({ "origin_trip_id": "T-1", "appointment_time": "2024-03-06 09:00:00" })),
                rec(json!({ "appointment_time": "2024-03-06 09:00:00" })),
            ],
            ..FakeImporter::default()
        };

        let report = SyncCycle::new(&store, &remote, &notifier)
            .with_importer(&mut importer)
            .poll()
            .await
            .unwrap();

        assert_eq!((report.imported, report.skipped, report.unposted), (2, 1, 0));
        assert_eq!(importer.finalized, Some((2, 1, 0)));
        assert_eq!(remote.posts.lock().unwrap().len(), 2);
        assert_eq!(store.tracked_count().await.unwrap(), 2);
        assert!(report.errors[0].contains("origin_trip_id"));

        // The same origin key is an update of the trip already created
        importer.rows.truncate(1);
        let report = SyncCycle::new(&store, &remote, &notifier)
            .with_importer(&mut importer)
            .poll()
            .await
            .unwrap();

        assert_eq!(report.imported, 1);
        assert_eq!(remote.posts.lock().unwrap().len(), 2);
        assert_eq!(remote.puts.lock().unwrap().as_slice(), ["trip_tickets/101"]);
        assert_eq!(store.tracked_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_rejected_post_leaves_row_unposted() {
        let (store, _dir) = setup().await;
        let remote = FakeRemote {
            fail_post: true,
            ..FakeRemote::default()
        };
        let notifier = FakeNotifier::default();
        let mut importer = FakeImporter {
            rows: vec![rec(json!({ "origin_trip_id": "T-1", "appointment_time": "2024-03-05 09:00:00" }))],
            ..FakeImporter::default()
        };

        let report = SyncCycle::new(&store, &remote, &notifier)
            .with_importer(&mut importer)
            .poll()
            .await
            .unwrap();

        assert_eq!(report.unposted, 1);
        assert!(report.errors[0].starts_with("API error on POST"));
        assert_eq!(notifier.messages().len(), 1);

        // The unsynced record waits for the next attempt
        let tracked = store.find_by_remote_id("101").await.unwrap();
        assert!(tracked.is_none());
        assert_eq!(store.tracked_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_response_without_id_leaves_row_unposted() {
        let (store, _dir) = setup().await;
        let remote = FakeRemote {
            omit_id: true,
            ..FakeRemote::default()
        };
        let notifier = FakeNotifier::default();
        let mut importer = FakeImporter {
            rows: vec![rec(json!({ "origin_trip_id": "T-1", "appointment_time": "2024-03-05 09:00:00" }))],
            ..FakeImporter::default()
        };

        let report = SyncCycle::new(&store, &remote, &notifier)
            .with_importer(&mut importer)
            .poll()
            .await
            .unwrap();

        assert_eq!(report.unposted, 1);
        assert_eq!(report.errors, vec!["API result does not contain an ID".to_string()]);
    }

    #[test]
    fn test_updated_since_format() {
        let since = DateTime::parse_from_rfc3339("2024-03-01T10:00:00.25Z").unwrap().with_timezone(&Utc);
        assert_eq!(updated_since(since), "2024-03-01 10:00:00.250000");
    }
}
