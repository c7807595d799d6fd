mod commands;
mod logging;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::migrate::{self, MigrateContext};
use elif_migrate::MigrationConfig;
use logging::{init_logging, LogFormat, LoggingConfig};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "elif-migrate")]
#[command(about = "Versioned SQL change-set migrations")]
#[command(version)]
struct Cli {
    /// Target database URL (postgres://... or sqlite:...); defaults to $DATABASE_URL
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Directory holding <version>_<name>.sql files; defaults to $ELIF_MIGRATIONS_DIR
    /// or ./migrations
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Print results as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    /// Log line format on stderr
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply all pending migrations
    Apply,

    /// Reverse the most recently applied migrations
    Reverse {
        /// How many migrations to reverse, newest first
        #[arg(long, short, default_value_t = 1)]
        steps: usize,
    },

    /// Show applied, failed and pending migrations
    Status,

    /// Create a new migration file with the next version
    Create {
        /// Migration name
        name: String,
    },

    /// Print the version the next migration would get
    NextVersion,
}

impl Cli {
    fn context(&self) -> Result<MigrateContext> {
        let mut config = MigrationConfig::from_env()?;
        if let Some(url) = &self.database_url {
            config = config.with_database_url(url.clone());
        }
        if let Some(dir) = &self.dir {
            config = config.with_migrations_dir(dir.clone());
        }
        config.validate()?;

        Ok(MigrateContext {
            config,
            json: self.json,
        })
    }

    fn logging(&self) -> LoggingConfig {
        let config = LoggingConfig::default().with_format(self.log_format);
        if self.json {
            config.quiet()
        } else {
            config
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let ctx = cli.context()?;

    match cli.command {
        Commands::Apply => migrate::apply(&ctx).await,
        Commands::Reverse { steps } => migrate::reverse(&ctx, steps).await,
        Commands::Status => migrate::status(&ctx).await,
        Commands::Create { name } => migrate::create(&ctx, &name).await,
        Commands::NextVersion => migrate::next_version(&ctx).await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.logging()) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::fs;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_reverse_steps() {
        let cli = Cli::try_parse_from(["elif-migrate", "reverse", "--steps", "3"]).unwrap();
        assert!(matches!(cli.command, Commands::Reverse { steps: 3 }));

        let cli = Cli::try_parse_from(["elif-migrate", "reverse"]).unwrap();
        assert!(matches!(cli.command, Commands::Reverse { steps: 1 }));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "elif-migrate",
            "status",
            "--json",
            "--dir",
            "db/migrations",
            "--database-url",
            "sqlite::memory:",
        ])
        .unwrap();

        assert!(cli.json);
        let ctx = cli.context().unwrap();
        assert_eq!(ctx.config.migrations_dir, PathBuf::from("db/migrations"));
        assert_eq!(ctx.config.database_url.as_deref(), Some("sqlite::memory:"));
    }

    #[tokio::test]
    async fn test_commands_against_sqlite() {
        let dir = tempfile::TempDir::new().unwrap();
        let migrations = dir.path().join("migrations");
        let url = format!("sqlite://{}", dir.path().join("cli.db").display());

        let ctx = MigrateContext {
            config: MigrationConfig::new()
                .with_migrations_dir(&migrations)
                .with_database_url(url),
            json: true,
        };

        migrate::next_version(&ctx).await.unwrap();
        migrate::create(&ctx, "create widgets").await.unwrap();
        let created = migrations.join("001_create_widgets.sql");
        fs::write(
            &created,
            "CREATE TABLE widgets (id INTEGER);\n\
             -- reverse:begin\n\
             DROP TABLE widgets;\n\
             -- reverse:end\n",
        )
        .unwrap();

        migrate::apply(&ctx).await.unwrap();
        migrate::status(&ctx).await.unwrap();
        migrate::reverse(&ctx, 1).await.unwrap();
    }
}
