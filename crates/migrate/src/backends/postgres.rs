//! PostgreSQL Backend Implementation
//!
//! The coordination lock is a session-level advisory lock, so it is tied to
//! this connection: if the process dies the server drops the claim with the
//! session and no lease timer is involved.

use async_trait::async_trait;
use sqlx::{Connection, Executor, PgConnection};
use std::time::Duration;

use super::{DatabaseBackendType, MigrationConnection};
use crate::migrations::definitions::ExecutionRecord;

pub struct PostgresConnection {
    conn: PgConnection,
}

impl PostgresConnection {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let conn = PgConnection::connect(database_url).await?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: PgConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl MigrationConnection for PostgresConnection {
    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::PostgreSQL
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
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_name = $1)",
        )
        .bind(table)
        .fetch_one(&mut self.conn)
        .await
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

    async fn try_lock(&mut self, key: i64, _lease: Duration) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut self.conn)
            .await
    }

    async fn renew_lock(&mut self, key: i64, _lease: Duration) -> Result<bool, sqlx::Error> {
        // Nothing to extend; only confirm the session still owns the lock.
        // A bigint advisory key is stored as classid (high half) + objid (low half).
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM pg_locks \
             WHERE locktype = 'advisory' AND granted AND pid = pg_backend_pid() \
             AND objsubid = 1 \
             AND ((classid::bigint << 32) | objid::bigint) = $1)",
        )
        .bind(key)
        .fetch_one(&mut self.conn)
        .await
    }

    async fn unlock(&mut self, key: i64) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .fetch_one(&mut self.conn)
            .await
    }

    async fn close(self: Box<Self>) -> Result<(), sqlx::Error> {
        self.conn.close().await
    }
}
