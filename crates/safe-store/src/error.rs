//! Error types for store construction and I/O.

use std::path::PathBuf;

use thiserror::Error;

use crate::version::SchemaVersion;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the store.
///
/// Write failures inside the write queue and parse failures while validating
/// an external edit are logged and never reach callers; everything here is
/// either fatal to construction or returned from an explicit operation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot create store directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Migration {version} failed: {message}")]
    Migration {
        version: SchemaVersion,
        message: String,
    },

    #[error("Invalid schema version '{0}'")]
    InvalidVersion(String),

    #[error("A store is already open for {0}")]
    AlreadyOpen(PathBuf),

    #[error("Unknown store: {0}")]
    UnknownStore(String),

    #[error("File watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Backup failed: {0}")]
    Backup(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Error returned from inside a migration closure.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct MigrationError(pub String);

impl MigrationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
