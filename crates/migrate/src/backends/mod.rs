//! Database Backend Abstractions
//!
//! The migration engine only needs a narrow slice of a database: run a
//! script, bracket it in a transaction, read and write execution records,
//! and claim a non-blocking named lock. [`MigrationConnection`] is that
//! slice; each backend implements it over a single `sqlx` connection so the
//! lock and the work it protects share one session.

pub mod postgres;
pub mod sqlite;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{MigrateError, MigrateResult};
use crate::migrations::definitions::ExecutionRecord;

pub use postgres::PostgresConnection;
pub use sqlite::SqliteConnection;

/// Database backend type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseBackendType {
    PostgreSQL,
    SQLite,
}

impl DatabaseBackendType {
    /// Detect the backend from a connection URL scheme
    pub fn from_url(url: &str) -> MigrateResult<Self> {
        let scheme = url.split(':').next().unwrap_or_default();
        scheme.parse().map_err(|reason: String| {
            MigrateError::Configuration(crate::config::ConfigError::InvalidValue {
                field: "database_url".to_string(),
                value: redact_url(url),
                expected: reason,
            })
        })
    }

    /// Column type used for `executed_at`
    pub fn timestamp_type(&self) -> &'static str {
        match self {
            DatabaseBackendType::PostgreSQL => "TIMESTAMPTZ",
            DatabaseBackendType::SQLite => "TIMESTAMP",
        }
    }
}

impl std::fmt::Display for DatabaseBackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseBackendType::PostgreSQL => write!(f, "postgresql"),
            DatabaseBackendType::SQLite => write!(f, "sqlite"),
        }
    }
}

impl std::str::FromStr for DatabaseBackendType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(DatabaseBackendType::PostgreSQL),
            "sqlite" => Ok(DatabaseBackendType::SQLite),
            _ => Err(format!("a postgres:// or sqlite: URL, got scheme '{}'", s)),
        }
    }
}

/// SQL execution capability consumed by the migration engine.
///
/// Methods return raw `sqlx` errors; the caller decides whether a failure
/// is an execution error, a schema error, or a plain database error.
#[async_trait]
pub trait MigrationConnection: Send {
    fn backend_type(&self) -> DatabaseBackendType;

    /// Run an unprepared, possibly multi-statement script
    async fn execute_script(&mut self, sql: &str) -> Result<u64, sqlx::Error>;

    /// Run a single statement with text parameters bound as `$1..$n`
    async fn execute_bound(&mut self, sql: &str, params: &[&str]) -> Result<u64, sqlx::Error>;

    async fn begin(&mut self) -> Result<(), sqlx::Error> {
        self.execute_script("BEGIN").await.map(|_| ())
    }

    async fn commit(&mut self) -> Result<(), sqlx::Error> {
        self.execute_script("COMMIT").await.map(|_| ())
    }

    async fn rollback(&mut self) -> Result<(), sqlx::Error> {
        self.execute_script("ROLLBACK").await.map(|_| ())
    }

    /// Whether a table with this name is visible to the connection
    async fn table_exists(&mut self, table: &str) -> Result<bool, sqlx::Error>;

    /// Fetch execution records with a query selecting every record column
    async fn fetch_records(&mut self, sql: &str) -> Result<Vec<ExecutionRecord>, sqlx::Error>;

    /// Write an execution record; columns are bound in declaration order
    async fn write_record(
        &mut self,
        sql: &str,
        record: &ExecutionRecord,
    ) -> Result<u64, sqlx::Error>;

    /// Non-blocking claim on `key`. `Ok(false)` means another holder has it.
    async fn try_lock(&mut self, key: i64, lease: Duration) -> Result<bool, sqlx::Error>;

    /// Confirm (and for lease-based locks, extend) a claim this connection holds
    async fn renew_lock(&mut self, key: i64, lease: Duration) -> Result<bool, sqlx::Error>;

    /// Give up a claim. `Ok(false)` means this connection no longer held it.
    async fn unlock(&mut self, key: i64) -> Result<bool, sqlx::Error>;

    async fn close(self: Box<Self>) -> Result<(), sqlx::Error>;
}

/// Open a connection for the backend named by the URL scheme
pub async fn connect(database_url: &str) -> MigrateResult<Box<dyn MigrationConnection>> {
    let backend = DatabaseBackendType::from_url(database_url)?;
    let connection: Box<dyn MigrationConnection> = match backend {
        DatabaseBackendType::PostgreSQL => {
            Box::new(PostgresConnection::connect(database_url).await?)
        }
        DatabaseBackendType::SQLite => Box::new(SqliteConnection::connect(database_url).await?),
    };

    tracing::debug!(
        backend = %connection.backend_type(),
        url = %redact_url(database_url),
        "opened migration connection"
    );
    Ok(connection)
}

/// Strip credentials from a URL before it reaches logs or errors
pub fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}
