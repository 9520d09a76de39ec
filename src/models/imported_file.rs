use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A source file an importer has fully processed.
///
/// The (file name, size, modification time) triple identifies the file so
/// that it is never processed twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportedFileRecord {
    pub id: Option<i64>,
    pub file_name: String,
    pub size: i64,
    pub modified: DateTime<Utc>,
    pub rows: i64,
    pub row_errors: i64,
    pub error: bool,
    pub error_msg: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ImportedFileRecord {
    pub fn new(file_name: impl Into<String>, size: i64, modified: DateTime<Utc>) -> Self {
        Self {
            id: None,
            file_name: file_name.into(),
            size,
            modified,
            rows: 0,
            row_errors: 0,
            error: false,
            error_msg: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_rows(mut self, rows: i64, row_errors: i64) -> Self {
        self.rows = rows;
        self.row_errors = row_errors;
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = true;
        self.error_msg = Some(message.into());
        self
    }
}
