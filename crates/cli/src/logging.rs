//! Logging setup for the CLI
//!
//! Logs go to stderr so that `--json` output on stdout stays machine-readable.

use std::io;
use tracing_subscriber::{fmt::Layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Logging configuration for the CLI
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level used when RUST_LOG is not set
    pub level: String,
    pub format: LogFormat,
    /// Filter directives (e.g. "elif_migrate=debug,sqlx=warn"); overrides `level`
    pub env_filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            env_filter: Some("elif_migrate=info,sqlx=warn".to_string()),
        }
    }
}

impl LoggingConfig {
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Only warnings and errors, for machine-readable runs
    pub fn quiet(mut self) -> Self {
        self.level = "warn".to_string();
        self.env_filter = Some("elif_migrate=warn,sqlx=error".to_string());
        self
    }

    fn directives(&self) -> &str {
        self.env_filter.as_deref().unwrap_or(&self.level)
    }
}

/// Install the global subscriber. RUST_LOG takes precedence over the config.
pub fn init_logging(
    config: &LoggingConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.directives()))?;

    match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(Layer::new().with_writer(io::stderr).json())
            .try_init()?,
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(Layer::new().with_writer(io::stderr).with_target(false))
            .try_init()?,
    }

    tracing::debug!(level = %config.level, format = ?config.format, "logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directives() {
        let config = LoggingConfig::default();
        assert_eq!(config.directives(), "elif_migrate=info,sqlx=warn");

        let config = LoggingConfig {
            env_filter: None,
            ..LoggingConfig::default()
        };
        assert_eq!(config.directives(), "info");

        let config = LoggingConfig::default().quiet().with_format(LogFormat::Json);
        assert_eq!(config.directives(), "elif_migrate=warn,sqlx=error");
        assert_eq!(config.format, LogFormat::Json);
    }
}
