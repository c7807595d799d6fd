//! # elif-migrate
//!
//! Versioned SQL change-set migrations for PostgreSQL and SQLite.
//!
//! Change-sets are `<version>_<name>.sql` files with an optional reverse
//! section between `-- reverse:begin` and `-- reverse:end`. The engine records
//! every attempt in `elif_schema_migrations`, applies pending files in order
//! inside one transaction each, reverses the newest ones on request, and
//! warns when an applied file has been edited since.
//!
//! ```no_run
//! use elif_migrate::{MigrationConfig, MigrationEngine};
//!
//! # async fn run() -> elif_migrate::MigrateResult<()> {
//! let config = MigrationConfig::from_env()?;
//! let mut engine = MigrationEngine::connect(&config).await?;
//! let report = engine.apply().await?;
//! println!("applied {} migration(s)", report.applied_count);
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod config;
pub mod error;
pub mod migrations;

pub use backends::{connect, DatabaseBackendType, MigrationConnection};
pub use config::{ConfigError, MigrationConfig};
pub use error::{MigrateError, MigrateResult};
pub use migrations::*;
