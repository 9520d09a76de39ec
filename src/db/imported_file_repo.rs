use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use super::tracked_repo::parse_column;
use crate::error::StoreError;
use crate::models::ImportedFileRecord;
use crate::value::format_timestamp;

#[derive(sqlx::FromRow)]
struct ImportedFileRow {
    id: i64,
    file_name: String,
    size: i64,
    modified: String,
    row_count: i64,
    row_errors: i64,
    error: bool,
    error_msg: Option<String>,
    created_at: String,
}

/// True if a file with this exact name, size and modification time was processed.
pub async fn exists(
    conn: &mut SqliteConnection,
    file_name: &str,
    size: i64,
    modified: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let found: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM imported_files WHERE file_name = ? AND size = ? AND modified = ? LIMIT 1",
    )
    .bind(file_name)
    .bind(size)
    .bind(format_timestamp(&modified))
    .fetch_optional(&mut *conn)
    .await?;

    Ok(found.is_some())
}

pub async fn insert(conn: &mut SqliteConnection, record: &ImportedFileRecord) -> Result<i64, StoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO imported_files (file_name, size, modified, row_count, row_errors, error, error_msg, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.file_name)
    .bind(record.size)
    .bind(format_timestamp(&record.modified))
    .bind(record.rows)
    .bind(record.row_errors)
    .bind(record.error)
    .bind(&record.error_msg)
    .bind(format_timestamp(&record.created_at))
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

pub async fn list(conn: &mut SqliteConnection) -> Result<Vec<ImportedFileRecord>, StoreError> {
    let rows: Vec<ImportedFileRow> = sqlx::query_as("SELECT * FROM imported_files ORDER BY id")
        .fetch_all(&mut *conn)
        .await?;

    rows.into_iter()
        .map(|row| {
            Ok(ImportedFileRecord {
                id: Some(row.id),
                modified: parse_column("modified", &row.modified)?,
                created_at: parse_column("created_at", &row.created_at)?,
                file_name: row.file_name,
                size: row.size,
                rows: row.row_count,
                row_errors: row.row_errors,
                error: row.error,
                error_msg: row.error_msg,
            })
        })
        .collect()
}

pub async fn count(conn: &mut SqliteConnection) -> Result<i64, StoreError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM imported_files")
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_insert_and_exists() {
        let temp_dir = TempDir::new().unwrap();
        let pool = init_db(&temp_dir.path().join("test.db")).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let modified = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();

        assert!(!exists(&mut conn, "trips.csv", 120, modified).await.unwrap());

        let record = ImportedFileRecord::new("trips.csv", 120, modified).with_rows(3, 1);
        let id = insert(&mut conn, &record).await.unwrap();
        assert!(id > 0);

        assert!(exists(&mut conn, "trips.csv", 120, modified).await.unwrap());
        // A changed file is a different file
        assert!(!exists(&mut conn, "trips.csv", 121, modified).await.unwrap());

        let listed = list(&mut conn).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].rows, 3);
        assert_eq!(listed[0].row_errors, 1);
        assert_eq!(listed[0].modified, modified);
        assert_eq!(count(&mut conn).await.unwrap(), 1);
    }
}
