//! Migration Definitions - Core types shared by the migration components
//!
//! A [`ChangeSet`] is what a file on disk says can be applied; an
//! [`ExecutionRecord`] is what the target database says was attempted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::PathBuf;

/// One versioned unit of SQL parsed from a single file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    /// Zero-padded digit string; unique across the directory
    pub version: String,
    /// Human-readable name taken from the filename remainder
    pub name: String,
    /// SQL executed going forward
    pub apply_sql: String,
    /// SQL that undoes `apply_sql`, if the author provided one
    pub reverse_sql: Option<String>,
    /// Hex SHA-256 of the full file content
    pub checksum: String,
    /// File this change-set was read from
    pub path: PathBuf,
}

impl ChangeSet {
    pub fn is_reversible(&self) -> bool {
        self.reverse_sql.is_some()
    }
}

/// Persisted outcome of the last attempt at a version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ExecutionRecord {
    pub version: String,
    pub name: String,
    pub checksum: String,
    pub executed_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub succeeded: bool,
    pub error_message: Option<String>,
    pub reverse_sql: Option<String>,
}

impl ExecutionRecord {
    /// Record for a change-set whose SQL committed
    pub fn success(change_set: &ChangeSet, executed_at: DateTime<Utc>, duration_ms: i64) -> Self {
        Self {
            version: change_set.version.clone(),
            name: change_set.name.clone(),
            checksum: change_set.checksum.clone(),
            executed_at,
            duration_ms,
            succeeded: true,
            error_message: None,
            reverse_sql: change_set.reverse_sql.clone(),
        }
    }

    /// Record for a change-set whose SQL was rolled back
    pub fn failure(
        change_set: &ChangeSet,
        executed_at: DateTime<Utc>,
        duration_ms: i64,
        error_message: String,
    ) -> Self {
        Self {
            version: change_set.version.clone(),
            name: change_set.name.clone(),
            checksum: change_set.checksum.clone(),
            executed_at,
            duration_ms,
            succeeded: false,
            error_message: Some(error_message),
            reverse_sql: change_set.reverse_sql.clone(),
        }
    }
}

/// An applied change-set whose file no longer matches what was executed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Drift {
    pub version: String,
    pub name: String,
    pub recorded_checksum: String,
    pub current_checksum: String,
}

/// Result of running pending migrations
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    /// Number of change-sets applied in this run
    pub applied_count: usize,
    /// Versions applied, in execution order
    pub applied_versions: Vec<String>,
    /// Change-sets that were already applied and therefore skipped
    pub skipped_count: usize,
    /// Non-fatal checksum mismatches found before applying
    pub drift: Vec<Drift>,
    /// Wall time of the whole run in milliseconds
    pub execution_time_ms: u128,
}

/// Result of reversing migrations
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReverseReport {
    /// Number of change-sets reversed
    pub reversed_count: usize,
    /// Versions reversed, most recent first
    pub reversed_versions: Vec<String>,
    /// Wall time of the whole run in milliseconds
    pub execution_time_ms: u128,
}

/// Where a version stands when files and records are compared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationState {
    /// Succeeded and the file is still present
    Applied,
    /// Last attempt failed
    Failed,
    /// File present, no successful record
    Pending,
    /// Succeeded but the file has since been removed
    Orphaned,
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationState::Applied => write!(f, "applied"),
            MigrationState::Failed => write!(f, "failed"),
            MigrationState::Pending => write!(f, "pending"),
            MigrationState::Orphaned => write!(f, "orphaned"),
        }
    }
}

/// Per-version row of a status report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEntry {
    pub version: String,
    pub name: String,
    pub state: MigrationState,
    pub executed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    /// Applied, but the file checksum differs from the recorded one
    pub drifted: bool,
    /// Reverse SQL is available (recorded if executed, else from the file)
    pub reversible: bool,
}

/// Snapshot of every known version
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusReport {
    pub entries: Vec<StatusEntry>,
    pub applied: usize,
    pub failed: usize,
    pub pending: usize,
    pub orphaned: usize,
    pub drifted: usize,
}

impl StatusReport {
    pub(crate) fn from_entries(entries: Vec<StatusEntry>) -> Self {
        let count = |state: MigrationState| entries.iter().filter(|e| e.state == state).count();
        Self {
            applied: count(MigrationState::Applied),
            failed: count(MigrationState::Failed),
            pending: count(MigrationState::Pending),
            orphaned: count(MigrationState::Orphaned),
            drifted: entries.iter().filter(|e| e.drifted).count(),
            entries,
        }
    }

    /// Look up a single version
    pub fn entry(&self, version: &str) -> Option<&StatusEntry> {
        self.entries.iter().find(|e| e.version == version)
    }

    /// Versions in the given state, ascending
    pub fn versions_in(&self, state: MigrationState) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.state == state)
            .map(|e| e.version.as_str())
            .collect()
    }
}

/// Order two digit-string versions numerically without parsing them.
///
/// Leading zeros are ignored; ties fall back to the raw strings so that
/// `"01"` and `"001"` still have a total order.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let a_trim = a.trim_start_matches('0');
    let b_trim = b.trim_start_matches('0');
    a_trim
        .len()
        .cmp(&b_trim.len())
        .then_with(|| a_trim.cmp(b_trim))
        .then_with(|| a.cmp(b))
}
