pub mod imported_file_repo;
pub mod tracked_repo;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, Transaction};
use std::path::Path;
use std::str::FromStr;

use crate::error::StoreError;
use crate::models::{ImportedFileRecord, TrackedRecord};

/// Initialize the database connection pool and run migrations
pub async fn init_db(path: &Path) -> Result<SqlitePool, StoreError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| StoreError::Directory {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let db_url = format!("sqlite:{}?mode=rwc", path.display());

    let options = SqliteConnectOptions::from_str(&db_url)?
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    // Run migrations
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// The adapter's local cache of tracked trip tickets and imported files.
#[derive(Clone)]
pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(init_db(path).await?))
    }

    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Starts the transaction a whole sync cycle runs in.
    pub async fn begin(&self) -> Result<StoreTransaction, StoreError> {
        Ok(StoreTransaction {
            tx: self.pool.begin().await?,
        })
    }

    pub async fn tracked_count(&self) -> Result<i64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        tracked_repo::count(&mut conn).await
    }

    pub async fn max_remote_updated_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        tracked_repo::max_remote_updated_at(&mut conn).await
    }

    pub async fn imported_file_count(&self) -> Result<i64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        imported_file_repo::count(&mut conn).await
    }

    pub async fn find_by_remote_id(&self, remote_id: &str) -> Result<Option<TrackedRecord>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        tracked_repo::find_by_remote_id(&mut conn, remote_id).await
    }
}

/// All local writes of one cycle. Dropping it without `commit` rolls back.
pub struct StoreTransaction {
    tx: Transaction<'static, Sqlite>,
}

impl StoreTransaction {
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut *self.tx
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }

    pub async fn find_by_remote_id(&mut self, remote_id: &str) -> Result<Option<TrackedRecord>, StoreError> {
        tracked_repo::find_by_remote_id(self.conn(), remote_id).await
    }

    pub async fn find_or_create_by_origin_key(
        &mut self,
        origin_id: &str,
        origin_timestamp: DateTime<Utc>,
    ) -> Result<TrackedRecord, StoreError> {
        tracked_repo::find_or_create_by_origin_key(self.conn(), origin_id, origin_timestamp).await
    }

    pub async fn find_by_origin_key(
        &mut self,
        origin_id: &str,
        origin_timestamp: DateTime<Utc>,
    ) -> Result<Option<TrackedRecord>, StoreError> {
        tracked_repo::find_by_origin_key(self.conn(), origin_id, origin_timestamp).await
    }

    pub async fn max_remote_updated_at(&mut self) -> Result<Option<DateTime<Utc>>, StoreError> {
        tracked_repo::max_remote_updated_at(self.conn()).await
    }

    pub async fn save(&mut self, record: &TrackedRecord) -> Result<(), StoreError> {
        tracked_repo::save(self.conn(), record).await
    }

    pub async fn is_file_imported(
        &mut self,
        file_name: &str,
        size: i64,
        modified: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        imported_file_repo::exists(self.conn(), file_name, size, modified).await
    }

    pub async fn record_imported_file(&mut self, record: &ImportedFileRecord) -> Result<i64, StoreError> {
        imported_file_repo::insert(self.conn(), record).await
    }
}
