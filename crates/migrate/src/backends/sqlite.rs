//! SQLite Backend Implementation
//!
//! SQLite has no session-scoped named lock, so the coordination lock is a
//! row in a lease table. A claim is only taken over once its `expires_at`
//! has passed; the holder extends it through [`MigrationConnection::renew_lock`].

use async_trait::async_trait;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection, Executor};
use std::str::FromStr;
use std::time::Duration;

use super::{DatabaseBackendType, MigrationConnection};
use crate::config::LOCK_TABLE;
use crate::migrations::definitions::ExecutionRecord;

pub struct SqliteConnection {
    conn: sqlx::SqliteConnection,
    holder: String,
}

impl SqliteConnection {
    /// Connect, creating the database file if it does not exist yet
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let conn = options.connect().await?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: sqlx::SqliteConnection) -> Self {
        Self {
            conn,
            holder: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Identity written into the lease table for claims made by this connection
    pub fn holder(&self) -> &str {
        &self.holder
    }

    fn lease_deadline(lease: Duration) -> i64 {
        let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
        chrono::Utc::now().timestamp_millis().saturating_add(lease_ms)
    }

    async fn ensure_lock_table(&mut self) -> Result<(), sqlx::Error> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
                lock_key INTEGER PRIMARY KEY,\n    \
                holder TEXT NOT NULL,\n    \
                acquired_at TEXT NOT NULL,\n    \
                expires_at INTEGER NOT NULL\n\
            )",
            LOCK_TABLE
        );
        self.conn.execute(sql.as_str()).await?;
        Ok(())
    }

    async fn claim_lease(&mut self, key: i64, lease: Duration) -> Result<bool, sqlx::Error> {
        self.ensure_lock_table().await?;

        let now = chrono::Utc::now();
        let sql = format!(
            "INSERT INTO {table} (lock_key, holder, acquired_at, expires_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (lock_key) DO UPDATE SET \
                holder = excluded.holder, \
                acquired_at = excluded.acquired_at, \
                expires_at = excluded.expires_at \
             WHERE {table}.expires_at <= $5",
            table = LOCK_TABLE
        );

        let result = sqlx::query(&sql)
            .bind(key)
            .bind(&self.holder)
            .bind(now.to_rfc3339())
            .bind(Self::lease_deadline(lease))
            .bind(now.timestamp_millis())
            .execute(&mut self.conn)
            .await?;

        Ok(result.rows_affected() == 1)
    }
}

/// `SQLITE_BUSY` or `SQLITE_LOCKED`, including their extended codes
fn is_busy(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|e| e.code())
        .and_then(|code| code.parse::<i32>().ok())
        .map_or(false, |code| matches!(code & 0xff, 5 | 6))
}

#[async_trait]
impl MigrationConnection for SqliteConnection {
    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::SQLite
    }

    async fn execute_script(&mut self, sql: &str) -> Result<u64, sqlx::Error> {
        let result = self.conn.execute(sql).await?;
        Ok(result.rows_affected())
    }

    async fn execute_bound(&mut self, sql: &str, params: &[&str]) -> Result<u64, sqlx::Error> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = query.bind(*param);
        }
        let result = query.execute(&mut self.conn).await?;
        Ok(result.rows_affected())
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool, sqlx::Error> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = $1",
        )
        .bind(table)
        .fetch_one(&mut self.conn)
        .await?;
        Ok(count > 0)
    }

    async fn fetch_records(&mut self, sql: &str) -> Result<Vec<ExecutionRecord>, sqlx::Error> {
        sqlx::query_as::<_, ExecutionRecord>(sql)
            .fetch_all(&mut self.conn)
            .await
    }

    async fn write_record(
        &mut self,
        sql: &str,
        record: &ExecutionRecord,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(sql)
            .bind(&record.version)
            .bind(&record.name)
            .bind(&record.checksum)
            .bind(record.executed_at)
            .bind(record.duration_ms)
            .bind(record.succeeded)
            .bind(record.error_message.as_deref())
            .bind(record.reverse_sql.as_deref())
            .execute(&mut self.conn)
            .await?;
        Ok(result.rows_affected())
    }

    async fn try_lock(&mut self, key: i64, lease: Duration) -> Result<bool, sqlx::Error> {
        // The claim must not wait behind another connection's write transaction.
        let busy_timeout = sqlx::query_scalar::<_, i64>("PRAGMA busy_timeout")
            .fetch_one(&mut self.conn)
            .await?;
        self.conn.execute("PRAGMA busy_timeout = 0").await?;

        let claimed = self.claim_lease(key, lease).await;

        let restore = format!("PRAGMA busy_timeout = {}", busy_timeout);
        self.conn.execute(restore.as_str()).await?;

        match claimed {
            Err(e) if is_busy(&e) => {
                tracing::debug!(key, error = %e, "lock table is busy, treating lock as held");
                Ok(false)
            }
            other => other,
        }
    }

    async fn renew_lock(&mut self, key: i64, lease: Duration) -> Result<bool, sqlx::Error> {
        let sql = format!(
            "UPDATE {} SET expires_at = $1 WHERE lock_key = $2 AND holder = $3",
            LOCK_TABLE
        );
        let result = sqlx::query(&sql)
            .bind(Self::lease_deadline(lease))
            .bind(key)
            .bind(&self.holder)
            .execute(&mut self.conn)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn unlock(&mut self, key: i64) -> Result<bool, sqlx::Error> {
        let sql = format!("DELETE FROM {} WHERE lock_key = $1 AND holder = $2", LOCK_TABLE);
        let result = sqlx::query(&sql)
            .bind(key)
            .bind(&self.holder)
            .execute(&mut self.conn)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn close(self: Box<Self>) -> Result<(), sqlx::Error> {
        self.conn.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory() -> SqliteConnection {
        SqliteConnection::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_script_runs_multiple_statements() {
        let mut conn = memory().await;
        conn.execute_script(
            "CREATE TABLE a (id INTEGER PRIMARY KEY); \
             INSERT INTO a (id) VALUES (1); \
             INSERT INTO a (id) VALUES (2);",
        )
        .await
        .unwrap();

        assert!(conn.table_exists("a").await.unwrap());
        assert!(!conn.table_exists("b").await.unwrap());
        let deleted = conn.execute_bound("DELETE FROM a WHERE id = $1", &["2"]).await.unwrap();
        assert_eq!(deleted, 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_script() {
        let mut conn = memory().await;
        conn.begin().await.unwrap();
        conn.execute_script("CREATE TABLE a (id INTEGER)").await.unwrap();
        conn.rollback().await.unwrap();
        assert!(!conn.table_exists("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_until_unlocked() {
        let dir = tempfile::TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("lock.db").display());
        let mut first = SqliteConnection::connect(&url).await.unwrap();
        let mut second = SqliteConnection::connect(&url).await.unwrap();
        let lease = Duration::from_secs(60);

        assert!(first.try_lock(42, lease).await.unwrap());
        assert!(!second.try_lock(42, lease).await.unwrap());
        assert!(second.try_lock(43, lease).await.unwrap());

        assert!(!second.unlock(42).await.unwrap());
        assert!(first.unlock(42).await.unwrap());
        assert!(second.try_lock(42, lease).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let dir = tempfile::TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("lease.db").display());
        let mut crashed = SqliteConnection::connect(&url).await.unwrap();
        let mut next = SqliteConnection::connect(&url).await.unwrap();

        assert!(crashed.try_lock(7, Duration::from_millis(1)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(next.try_lock(7, Duration::from_secs(60)).await.unwrap());
        assert!(!crashed.renew_lock(7, Duration::from_secs(60)).await.unwrap());
        assert!(next.renew_lock(7, Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_does_not_wait_on_open_write_transaction() {
        let dir = tempfile::TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("busy.db").display());
        let mut holder = SqliteConnection::connect(&url).await.unwrap();
        let mut contender = SqliteConnection::connect(&url).await.unwrap();
        let lease = Duration::from_secs(60);

        assert!(holder.try_lock(1, lease).await.unwrap());
        holder.begin().await.unwrap();
        holder.execute_script("CREATE TABLE long_running (id INTEGER)").await.unwrap();

        let started = std::time::Instant::now();
        assert!(!contender.try_lock(2, lease).await.unwrap());
        assert!(started.elapsed() < Duration::from_secs(2));

        holder.rollback().await.unwrap();
        assert!(contender.try_lock(2, lease).await.unwrap());

        let timeout = sqlx::query_scalar::<_, i64>("PRAGMA busy_timeout")
            .fetch_one(&mut contender.conn)
            .await
            .unwrap();
        assert!(timeout > 0);
    }
}
