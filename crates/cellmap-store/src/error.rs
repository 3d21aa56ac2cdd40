//! Error types for cellmap-store.

use std::path::PathBuf;

/// Result type for cellmap-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in cellmap-store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error from SQLite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to create database directory.
    #[error("Failed to create database directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Database was written by a newer schema than this build understands.
    #[error("Unsupported schema version {found} (newest known is {supported})")]
    UnsupportedVersion { found: i32, supported: i32 },

    /// Invalid timestamp.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// CSV export error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
