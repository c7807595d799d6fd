//! Error types for the migration engine
//!
//! Every failure the engine can surface is a variant of [`MigrateError`].
//! Drift is deliberately absent: it is reported, never raised.

use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigError;

/// Result type alias for migration operations
pub type MigrateResult<T> = Result<T, MigrateError>;

/// Error types for migration operations
#[derive(Debug, Error)]
pub enum MigrateError {
    /// A file in the migrations directory could not be parsed into a change-set
    #[error("Parse error in '{}': {reason}", .file.display())]
    Parse { file: PathBuf, reason: String },

    /// Another process holds the coordination lock
    #[error("Migration lock '{name}' is held by another process")]
    LockBusy { name: String },

    /// The lease on the coordination lock expired while this run held it
    #[error("Migration lock '{name}' was lost before the run completed")]
    LockLost { name: String },

    /// Change-set SQL failed; the outcome has already been recorded
    #[error("Migration {version} ({name}) failed: {message}")]
    Execution {
        version: String,
        name: String,
        message: String,
    },

    /// Reversal reached a version that was applied without reverse SQL
    #[error("Migration {version} has no reverse SQL and cannot be reversed")]
    MissingRollback { version: String },

    /// The state table could not be created or read
    #[error("Schema error: {message}")]
    Schema { message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
}

impl MigrateError {
    pub(crate) fn parse(file: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        MigrateError::Parse {
            file: file.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn schema(context: &str, err: sqlx::Error) -> Self {
        MigrateError::Schema {
            message: format!("{}: {}", context, err),
        }
    }

    /// Whether a caller may simply wait and re-invoke the operation
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, MigrateError::LockBusy { .. } | MigrateError::LockLost { .. })
    }
}
