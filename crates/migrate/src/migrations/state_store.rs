//! State Store - Execution records persisted in the target database
//!
//! The table layout is fixed; only the timestamp column type differs
//! between dialects.

use super::definitions::{compare_versions, ExecutionRecord};
use crate::backends::MigrationConnection;
use crate::config::STATE_TABLE;
use crate::error::{MigrateError, MigrateResult};

const RECORD_COLUMNS: &str =
    "version, name, checksum, executed_at, duration_ms, succeeded, error_message, reverse_sql";

/// Reads and writes [`ExecutionRecord`]s through a borrowed connection
#[derive(Debug, Clone, Copy, Default)]
pub struct StateStore;

impl StateStore {
    pub fn new() -> Self {
        Self
    }

    /// Create the state table and its version index if they are missing
    pub async fn ensure_schema(&self, conn: &mut dyn MigrationConnection) -> MigrateResult<()> {
        let sql = Self::create_table_sql(conn.backend_type().timestamp_type());
        conn.execute_script(&sql)
            .await
            .map_err(|e| MigrateError::schema("Failed to create state table", e))?;
        Ok(())
    }

    /// Whether the state table exists yet
    pub async fn exists(&self, conn: &mut dyn MigrationConnection) -> MigrateResult<bool> {
        conn.table_exists(STATE_TABLE)
            .await
            .map_err(|e| MigrateError::schema("Failed to inspect state table", e))
    }

    /// All records, ascending by version
    pub async fn load_all(
        &self,
        conn: &mut dyn MigrationConnection,
    ) -> MigrateResult<Vec<ExecutionRecord>> {
        let sql = format!("SELECT {} FROM {} ORDER BY version ASC", RECORD_COLUMNS, STATE_TABLE);
        let mut records = conn
            .fetch_records(&sql)
            .await
            .map_err(|e| MigrateError::schema("Failed to read state table", e))?;

        // Text ordering breaks down if version widths ever differ.
        records.sort_by(|a, b| compare_versions(&a.version, &b.version));
        Ok(records)
    }

    /// Insert a record, or overwrite the existing one for the same version
    pub async fn upsert(
        &self,
        conn: &mut dyn MigrationConnection,
        record: &ExecutionRecord,
    ) -> MigrateResult<()> {
        conn.write_record(&Self::upsert_sql(), record).await?;
        tracing::debug!(
            version = %record.version,
            succeeded = record.succeeded,
            "recorded migration outcome"
        );
        Ok(())
    }

    /// Remove the record for a version; returns whether a row was deleted
    pub async fn delete(
        &self,
        conn: &mut dyn MigrationConnection,
        version: &str,
    ) -> MigrateResult<bool> {
        let sql = format!("DELETE FROM {} WHERE version = $1", STATE_TABLE);
        let removed = conn.execute_bound(&sql, &[version]).await?;
        Ok(removed > 0)
    }

    fn create_table_sql(timestamp_type: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (\n    \
                version VARCHAR(255) NOT NULL PRIMARY KEY,\n    \
                name VARCHAR(255) NOT NULL,\n    \
                checksum VARCHAR(64) NOT NULL,\n    \
                executed_at {ts} NOT NULL,\n    \
                duration_ms BIGINT NOT NULL,\n    \
                succeeded BOOLEAN NOT NULL,\n    \
                error_message TEXT,\n    \
                reverse_sql TEXT\n\
            );\n\
            CREATE UNIQUE INDEX IF NOT EXISTS {table}_version_idx ON {table} (version);",
            table = STATE_TABLE,
            ts = timestamp_type,
        )
    }

    fn upsert_sql() -> String {
        format!(
            "INSERT INTO {table} ({columns}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (version) DO UPDATE SET \
                name = excluded.name, \
                checksum = excluded.checksum, \
                executed_at = excluded.executed_at, \
                duration_ms = excluded.duration_ms, \
                succeeded = excluded.succeeded, \
                error_message = excluded.error_message, \
                reverse_sql = excluded.reverse_sql",
            table = STATE_TABLE,
            columns = RECORD_COLUMNS,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::SqliteConnection;
    use chrono::{TimeZone, Utc};

    fn record(version: &str, succeeded: bool) -> ExecutionRecord {
        ExecutionRecord {
            version: version.to_string(),
            name: format!("migration {}", version),
            checksum: "a".repeat(64),
            executed_at: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            duration_ms: 12,
            succeeded,
            error_message: if succeeded { None } else { Some("boom".to_string()) },
            reverse_sql: Some(format!("DROP TABLE t{}", version)),
        }
    }

    #[test]
    fn test_schema_sql() {
        let sql = StateStore::create_table_sql("TIMESTAMPTZ");
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS elif_schema_migrations"));
        assert!(sql.contains("executed_at TIMESTAMPTZ NOT NULL"));
        assert!(sql.contains("reverse_sql TEXT"));
        assert!(
            sql.contains("CREATE UNIQUE INDEX IF NOT EXISTS elif_schema_migrations_version_idx")
        );
    }

    #[tokio::test]
    async fn test_ensure_schema_is_idempotent() {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        let store = StateStore::new();

        assert!(!store.exists(&mut conn).await.unwrap());
        store.ensure_schema(&mut conn).await.unwrap();
        store.ensure_schema(&mut conn).await.unwrap();
        assert!(store.exists(&mut conn).await.unwrap());
        assert!(store.load_all(&mut conn).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_overwrites_by_version() {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        let store = StateStore::new();
        store.ensure_schema(&mut conn).await.unwrap();

        store.upsert(&mut conn, &record("002", false)).await.unwrap();
        store.upsert(&mut conn, &record("001", true)).await.unwrap();

        let mut retried = record("002", true);
        retried.duration_ms = 40;
        store.upsert(&mut conn, &retried).await.unwrap();

        let records = store.load_all(&mut conn).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], record("001", true));
        assert_eq!(records[1], retried);
        assert!(records[1].error_message.is_none());
    }

    #[tokio::test]
    async fn test_delete() {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        let store = StateStore::new();
        store.ensure_schema(&mut conn).await.unwrap();
        store.upsert(&mut conn, &record("001", true)).await.unwrap();

        assert!(store.delete(&mut conn, "001").await.unwrap());
        assert!(!store.delete(&mut conn, "001").await.unwrap());
        assert!(store.load_all(&mut conn).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_without_table_is_schema_error() {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        let err = StateStore::new().load_all(&mut conn).await.unwrap_err();
        assert!(matches!(err, MigrateError::Schema { .. }));
    }
}
