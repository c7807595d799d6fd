//! Migration configuration
//!
//! Values come from defaults, then environment variables, then whatever the
//! caller overrides programmatically (the CLI applies its flags last).

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const ENV_MIGRATIONS_DIR: &str = "ELIF_MIGRATIONS_DIR";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_LOCK_NAME: &str = "ELIF_MIGRATE_LOCK_NAME";
pub const ENV_LOCK_TIMEOUT_SECS: &str = "ELIF_MIGRATE_LOCK_TIMEOUT_SECS";

/// Name of the persisted execution-record table
pub const STATE_TABLE: &str = "elif_schema_migrations";

/// Name of the lease table used where the database has no session-scoped lock
pub const LOCK_TABLE: &str = "elif_migration_locks";

const DEFAULT_LOCK_NAME: &str = "elif_migrations";
const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 600;

/// Configuration errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable: {var}")]
    MissingEnvVar { var: String },

    #[error("Invalid value for {field}: '{value}', expected {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Validation failed for {field}: {reason}")]
    ValidationFailed { field: String, reason: String },
}

/// Where a configuration value came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    EnvVar(String),
    Default,
    Programmatic,
}

/// Configuration for the migration engine
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Directory holding `<version>_<name>.sql` change-set files
    pub migrations_dir: PathBuf,
    /// Target database; only required by callers that open their own connection
    pub database_url: Option<String>,
    /// Name the coordination lock key is derived from
    pub lock_name: String,
    /// Backstop expiry for lease-based locks
    pub lock_timeout: Duration,
    sources: HashMap<&'static str, ConfigSource>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            migrations_dir: PathBuf::from("migrations"),
            database_url: None,
            lock_name: DEFAULT_LOCK_NAME.to_string(),
            lock_timeout: Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS),
            sources: HashMap::new(),
        }
    }
}

impl MigrationConfig {
    /// Create a default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from process environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new();

        if let Some(dir) = lookup(ENV_MIGRATIONS_DIR) {
            config.migrations_dir = PathBuf::from(dir);
            config.mark(ENV_MIGRATIONS_DIR, "migrations_dir");
        }

        if let Some(url) = lookup(ENV_DATABASE_URL) {
            config.database_url = Some(url);
            config.mark(ENV_DATABASE_URL, "database_url");
        }

        if let Some(name) = lookup(ENV_LOCK_NAME) {
            config.lock_name = name;
            config.mark(ENV_LOCK_NAME, "lock_name");
        }

        if let Some(secs) = lookup(ENV_LOCK_TIMEOUT_SECS) {
            let parsed: u64 = secs.trim().parse().map_err(|_| ConfigError::InvalidValue {
                field: "lock_timeout".to_string(),
                value: secs.clone(),
                expected: "a whole number of seconds".to_string(),
            })?;
            config.lock_timeout = Duration::from_secs(parsed);
            config.mark(ENV_LOCK_TIMEOUT_SECS, "lock_timeout");
        }

        config.validate()?;
        Ok(config)
    }

    fn mark(&mut self, var: &str, field: &'static str) {
        self.sources.insert(field, ConfigSource::EnvVar(var.to_string()));
    }

    pub fn with_migrations_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.migrations_dir = dir.into();
        self.sources.insert("migrations_dir", ConfigSource::Programmatic);
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self.sources.insert("database_url", ConfigSource::Programmatic);
        self
    }

    pub fn with_lock_name(mut self, name: impl Into<String>) -> Self {
        self.lock_name = name.into();
        self.sources.insert("lock_name", ConfigSource::Programmatic);
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self.sources.insert("lock_timeout", ConfigSource::Programmatic);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_name.trim().is_empty() {
            return Err(ConfigError::ValidationFailed {
                field: "lock_name".to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        if self.lock_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed {
                field: "lock_timeout".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        if self.migrations_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed {
                field: "migrations_dir".to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        Ok(())
    }

    /// The database URL, or an error naming the variable that should carry it
    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar {
                var: ENV_DATABASE_URL.to_string(),
            })
    }

    /// Where a field's value came from
    pub fn source_of(&self, field: &str) -> ConfigSource {
        self.sources
            .get(field)
            .cloned()
            .unwrap_or(ConfigSource::Default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = MigrationConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.migrations_dir, PathBuf::from("migrations"));
        assert_eq!(config.lock_name, "elif_migrations");
        assert_eq!(config.lock_timeout, Duration::from_secs(600));
        assert!(config.database_url.is_none());
        assert_eq!(config.source_of("lock_name"), ConfigSource::Default);
    }

    #[test]
    fn test_env_overrides() {
        let config = MigrationConfig::from_lookup(lookup_from(&[
            (ENV_MIGRATIONS_DIR, "db/changes"),
            (ENV_DATABASE_URL, "sqlite::memory:"),
            (ENV_LOCK_TIMEOUT_SECS, "30"),
        ]))
        .unwrap();

        assert_eq!(config.migrations_dir, PathBuf::from("db/changes"));
        assert_eq!(config.require_database_url().unwrap(), "sqlite::memory:");
        assert_eq!(config.lock_timeout, Duration::from_secs(30));
        assert_eq!(
            config.source_of("lock_timeout"),
            ConfigSource::EnvVar(ENV_LOCK_TIMEOUT_SECS.to_string())
        );
    }

    #[test]
    fn test_invalid_timeout_rejected() {
        let err = MigrationConfig::from_lookup(lookup_from(&[(ENV_LOCK_TIMEOUT_SECS, "soon")]))
            .unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "lock_timeout")
        );

        let err = MigrationConfig::from_lookup(lookup_from(&[(ENV_LOCK_TIMEOUT_SECS, "0")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::ValidationFailed { ref field, .. } if field == "lock_timeout"
        ));
    }

    #[test]
    fn test_missing_database_url() {
        let config = MigrationConfig::new();
        assert_eq!(
            config.require_database_url().unwrap_err(),
            ConfigError::MissingEnvVar {
                var: "DATABASE_URL".to_string()
            }
        );
    }
}
