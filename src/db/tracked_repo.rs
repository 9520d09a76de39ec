use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::TrackedRecord;
use crate::value::{format_timestamp, Record};

// Row type for database queries
#[derive(sqlx::FromRow)]
struct TrackedRow {
    local_id: String,
    remote_id: Option<String>,
    remote_updated_at: Option<String>,
    is_originated: bool,
    origin_id: Option<String>,
    origin_timestamp: Option<String>,
    snapshot: Option<String>,
    created_at: String,
    updated_at: String,
}

pub async fn find_by_remote_id(
    conn: &mut SqliteConnection,
    remote_id: &str,
) -> Result<Option<TrackedRecord>, StoreError> {
    let row: Option<TrackedRow> = sqlx::query_as("SELECT * FROM tracked_tickets WHERE remote_id = ?")
        .bind(remote_id)
        .fetch_optional(&mut *conn)
        .await?;

    row.map(hydrate).transpose()
}

pub async fn find_by_local_id(
    conn: &mut SqliteConnection,
    local_id: Uuid,
) -> Result<Option<TrackedRecord>, StoreError> {
    let row: Option<TrackedRow> = sqlx::query_as("SELECT * FROM tracked_tickets WHERE local_id = ?")
        .bind(local_id.to_string())
        .fetch_optional(&mut *conn)
        .await?;

    row.map(hydrate).transpose()
}

/// Looks up a trip originated here by origin id and appointment time.
pub async fn find_by_origin_key(
    conn: &mut SqliteConnection,
    origin_id: &str,
    origin_timestamp: DateTime<Utc>,
) -> Result<Option<TrackedRecord>, StoreError> {
    let row: Option<TrackedRow> = sqlx::query_as(
        "SELECT * FROM tracked_tickets WHERE is_originated = 1 AND origin_id = ? AND origin_timestamp = ?",
    )
    .bind(origin_id)
    .bind(format_timestamp(&origin_timestamp))
    .fetch_optional(&mut *conn)
    .await?;

    row.map(hydrate).transpose()
}

/// Returns the trip for an origin key, persisting a new unsynced one if none exists.
pub async fn find_or_create_by_origin_key(
    conn: &mut SqliteConnection,
    origin_id: &str,
    origin_timestamp: DateTime<Utc>,
) -> Result<TrackedRecord, StoreError> {
    if let Some(existing) = find_by_origin_key(conn, origin_id, origin_timestamp).await? {
        return Ok(existing);
    }
    let record = TrackedRecord::originated(origin_id, origin_timestamp);
    save(conn, &record).await?;
    Ok(record)
}

pub async fn max_remote_updated_at(conn: &mut SqliteConnection) -> Result<Option<DateTime<Utc>>, StoreError> {
    let max: Option<String> = sqlx::query_scalar("SELECT MAX(remote_updated_at) FROM tracked_tickets")
        .fetch_one(&mut *conn)
        .await?;

    max.map(|value| parse_column("remote_updated_at", &value)).transpose()
}

pub async fn count(conn: &mut SqliteConnection) -> Result<i64, StoreError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tracked_tickets")
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}

/// Inserts or updates a tracked record by its local id.
pub async fn save(conn: &mut SqliteConnection, record: &TrackedRecord) -> Result<(), StoreError> {
    let snapshot = record.snapshot.as_ref().map(serde_json::to_string).transpose()?;
    let updated_at = format_timestamp(&Utc::now());

    sqlx::query(
        r#"
        INSERT INTO tracked_tickets (local_id, remote_id, remote_updated_at, is_originated, origin_id, origin_timestamp, snapshot, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(local_id) DO UPDATE SET
            remote_id = excluded.remote_id,
            remote_updated_at = excluded.remote_updated_at,
            is_originated = excluded.is_originated,
            origin_id = excluded.origin_id,
            origin_timestamp = excluded.origin_timestamp,
            snapshot = excluded.snapshot,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(record.local_id.to_string())
    .bind(&record.remote_id)
    .bind(record.remote_updated_at.as_ref().map(format_timestamp))
    .bind(record.is_originated)
    .bind(&record.origin_id)
    .bind(record.origin_timestamp.as_ref().map(format_timestamp))
    .bind(snapshot)
    .bind(format_timestamp(&record.created_at))
    .bind(&updated_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

fn hydrate(row: TrackedRow) -> Result<TrackedRecord, StoreError> {
    let local_id = Uuid::parse_str(&row.local_id).map_err(|_| StoreError::InvalidColumn {
        column: "local_id",
        value: row.local_id.clone(),
    })?;
    let snapshot = row
        .snapshot
        .as_deref()
        .map(serde_json::from_str::<Record>)
        .transpose()?;

    Ok(TrackedRecord {
        local_id,
        remote_id: row.remote_id,
        remote_updated_at: row
            .remote_updated_at
            .as_deref()
            .map(|v| parse_column("remote_updated_at", v))
            .transpose()?,
        is_originated: row.is_originated,
        origin_id: row.origin_id,
        origin_timestamp: row
            .origin_timestamp
            .as_deref()
            .map(|v| parse_column("origin_timestamp", v))
            .transpose()?,
        snapshot,
        created_at: parse_column("created_at", &row.created_at)?,
        updated_at: parse_column("updated_at", &row.updated_at)?,
    })
}

pub(crate) fn parse_column(column: &'static str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidColumn {
            column,
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use chrono::TimeZone;
    use serde_json::json;
    use sqlx::SqlitePool;
    use tempfile::TempDir;

    struct TestContext {
        pool: SqlitePool,
        _temp_dir: TempDir, // Keep alive for duration of test
    }

    async fn setup() -> TestContext {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let pool = init_db(&db_path).await.unwrap();
        TestContext {
            pool,
            _temp_dir: temp_dir,
        }
    }

    #[tokio::test]
    async fn test_save_and_find_by_remote_id() {
        let ctx = setup().await;
        let mut conn = ctx.pool.acquire().await.unwrap();

        let remote = json!({
            "id": 12,
            "updated_at": "2024-03-01T10:00:00Z",
            "trip_claims": [{ "id": 1, "status": "pending" }]
        });
        let record = TrackedRecord::from_remote(remote.as_object().unwrap());
        save(&mut conn, &record).await.unwrap();

        let found = find_by_remote_id(&mut conn, "12").await.unwrap().unwrap();
        assert_eq!(found.local_id, record.local_id);
        assert_eq!(found.snapshot.as_ref(), remote.as_object());
        assert_eq!(found.remote_updated_at, record.remote_updated_at);
        assert!(find_by_remote_id(&mut conn, "13").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_updates_existing_row() {
        let ctx = setup().await;
        let mut conn = ctx.pool.acquire().await.unwrap();

        let mut record = TrackedRecord::new();
        save(&mut conn, &record).await.unwrap();
        record.remote_id = Some("55".to_string());
        save(&mut conn, &record).await.unwrap();

        assert_eq!(count(&mut conn).await.unwrap(), 1);
        let found = find_by_local_id(&mut conn, record.local_id).await.unwrap().unwrap();
        assert_eq!(found.remote_id.as_deref(), Some("55"));
    }

    #[tokio::test]
    async fn test_find_or_create_by_origin_key() {
        let ctx = setup().await;
        let mut conn = ctx.pool.acquire().await.unwrap();
        let morning = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let evening = Utc.with_ymd_and_hms(2024, 3, 1, 18, 0, 0).unwrap();

        let first = find_or_create_by_origin_key(&mut conn, "T-1", morning).await.unwrap();
        let again = find_or_create_by_origin_key(&mut conn, "T-1", morning).await.unwrap();
        let reused = find_or_create_by_origin_key(&mut conn, "T-1", evening).await.unwrap();

        assert_eq!(first.local_id, again.local_id);
        assert_ne!(first.local_id, reused.local_id);
        assert_eq!(count(&mut conn).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_origin_key_lookup_ignores_inbound_records() {
        let ctx = setup().await;
        let mut conn = ctx.pool.acquire().await.unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();

        let inbound = json!({ "id": 3, "is_originated": false, "origin_trip_id": "T-1", "appointment_time": "2024-03-01T09:00:00Z" });
        save(&mut conn, &TrackedRecord::from_remote(inbound.as_object().unwrap()))
            .await
            .unwrap();

        assert!(find_by_origin_key(&mut conn, "T-1", ts).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_origin_key_lookup_finds_synced_records() {
        let ctx = setup().await;
        let mut conn = ctx.pool.acquire().await.unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();

        let mut record = find_or_create_by_origin_key(&mut conn, "T-1", ts).await.unwrap();
        record.remote_id = Some("77".to_string());
        save(&mut conn, &record).await.unwrap();

        let found = find_by_origin_key(&mut conn, "T-1", ts).await.unwrap().unwrap();
        assert_eq!(found.remote_id.as_deref(), Some("77"));
    }

    #[tokio::test]
    async fn test_max_remote_updated_at() {
        let ctx = setup().await;
        let mut conn = ctx.pool.acquire().await.unwrap();
        assert_eq!(max_remote_updated_at(&mut conn).await.unwrap(), None);

        for (id, updated_at) in [(1, "2024-03-01T10:00:00Z"), (2, "2024-03-02T08:00:00Z"), (3, "2024-02-28T23:00:00Z")] {
            let remote = json!({ "id": id, "updated_at": updated_at });
            save(&mut conn, &TrackedRecord::from_remote(remote.as_object().unwrap()))
                .await
                .unwrap();
        }

        assert_eq!(
            max_remote_updated_at(&mut conn).await.unwrap(),
            Some(Utc.with_ymd_and_hms(2024, 3, 2, 8, 0, 0).unwrap())
        );
    }
}
