//! Error types for the adapter.

use std::path::PathBuf;

use thiserror::Error;

/// A mapping or normalization rule document is malformed.
///
/// These are never retried: they mean the deployment's rule files are wrong.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Invalid rule for '{field}': {reason}")]
    InvalidRule { field: String, reason: String },

    #[error("Invalid transformation '{name}' for '{field}'")]
    UnknownTransformation { field: String, name: String },

    #[error("Invalid regular expression '{pattern}' for '{field}': {source}")]
    InvalidPattern {
        field: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Failed to read rule document '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse rule document '{}': {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Rule document must be a map of field names to rules")]
    NotAMap,
}

impl ConfigurationError {
    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigurationError::InvalidRule {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Local storage failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Failed to create database directory '{}': {source}", .path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Stored snapshot is not valid JSON: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("Invalid stored value in column '{column}': {value}")]
    InvalidColumn { column: &'static str, value: String },
}

/// Failures talking to the Clearinghouse API.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("API not configured: missing {0}")]
    NotConfigured(&'static str),

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("API returned {status} for {method} {path}: {body}")]
    Status {
        method: &'static str,
        path: String,
        status: u16,
        body: String,
    },

    #[error("API returned an unexpected response for {path}: {reason}")]
    InvalidResponse { path: String, reason: String },
}

/// Failures inside an importer or exporter.
#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("{0}")]
    NotConfigured(String),

    #[error("Folder '{}' does not exist", .0.display())]
    MissingFolder(PathBuf),

    #[error("I/O error for '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error for '{}': {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error(transparent)]
    Rules(#[from] ConfigurationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures delivering a notification.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Notification recipient not configured")]
    NotConfigured,

    #[error("Failed to build notification: {0}")]
    Message(String),

    #[error("Failed to send notification: {0}")]
    Transport(String),
}

/// A failure that aborts a whole reconciliation cycle.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("{phase} failed: {source}")]
    Remote {
        phase: &'static str,
        #[source]
        source: RemoteError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Processor(#[from] ProcessorError),
}
