//! PostgreSQL behaviour. Runs only when ELIF_MIGRATE_TEST_POSTGRES_URL points
//! at a scratch database; otherwise each test returns early.

use std::fs;
use std::time::Duration;
use tempfile::TempDir;

use elif_migrate::backends::PostgresConnection;
use elif_migrate::{
    MigrateError, MigrationConfig, MigrationConnection, MigrationEngine, MigrationState,
};

const ENV_URL: &str = "ELIF_MIGRATE_TEST_POSTGRES_URL";

fn postgres_url() -> Option<String> {
    std::env::var(ENV_URL).ok().filter(|url| !url.is_empty())
}

async fn reset(url: &str) {
    let mut conn = PostgresConnection::connect(url).await.unwrap();
    conn.execute_script(
        "DROP TABLE IF EXISTS elif_schema_migrations; \
         DROP TABLE IF EXISTS pg_test_users; \
         DROP TABLE IF EXISTS pg_test_never;",
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn test_postgres_apply_reverse_and_lock() {
    let Some(url) = postgres_url() else {
        eprintln!("skipping: {} not set", ENV_URL);
        return;
    };
    reset(&url).await;

    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("001_users.sql"),
        "CREATE TABLE pg_test_users (id BIGSERIAL PRIMARY KEY, email TEXT NOT NULL);\n\
         CREATE INDEX pg_test_users_email_idx ON pg_test_users (email);\n\
         -- reverse:begin\n\
         DROP TABLE pg_test_users;\n\
         -- reverse:end\n",
    )
    .unwrap();
    fs::write(dir.path().join("002_bad.sql"), "CREATE TABLE pg_test_never (;\n").unwrap();

    let config = MigrationConfig::new()
        .with_migrations_dir(dir.path())
        .with_database_url(url.clone())
        .with_lock_name("elif_migrate_pg_test")
        .with_lock_timeout(Duration::from_secs(30));

    let mut holder = MigrationEngine::connect(&config).await.unwrap();
    let mut engine = MigrationEngine::connect(&config).await.unwrap();

    let lock = holder.lock().clone();
    lock.acquire(holder.connection_mut()).await.unwrap();
    lock.renew(holder.connection_mut()).await.unwrap();
    assert!(matches!(engine.apply().await.unwrap_err(), MigrateError::LockBusy { .. }));
    lock.release(holder.connection_mut()).await.unwrap();

    let err = engine.apply().await.unwrap_err();
    assert!(matches!(err, MigrateError::Execution { ref version, .. } if version == "002"));

    let status = engine.status().await.unwrap();
    assert_eq!(status.entry("001").unwrap().state, MigrationState::Applied);
    assert_eq!(status.entry("002").unwrap().state, MigrationState::Failed);

    assert_eq!(engine.reverse(1).await.unwrap().reversed_versions, vec!["001"]);
    assert!(!engine.connection_mut().table_exists("pg_test_users").await.unwrap());

    // the session-scoped lock dies with the connection
    lock.acquire(holder.connection_mut()).await.unwrap();
    holder.close().await.unwrap();
    assert_eq!(engine.reverse(1).await.unwrap().reversed_count, 0);

    engine.close().await.unwrap();
    reset(&url).await;
}
