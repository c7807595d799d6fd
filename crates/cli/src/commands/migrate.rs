use anyhow::{Context, Result};
use elif_migrate::{
    ApplyReport, ChangeSetRepository, MigrationConfig, MigrationEngine, MigrationState,
    ReverseReport, StatusReport,
};
use std::fmt::Write as _;

/// Settings shared by every migrate subcommand
pub struct MigrateContext {
    pub config: MigrationConfig,
    pub json: bool,
}

async fn open_engine(ctx: &MigrateContext) -> Result<MigrationEngine> {
    MigrationEngine::connect(&ctx.config)
        .await
        .context("Failed to connect to the target database")
}

async fn close_quietly(engine: MigrationEngine) {
    if let Err(e) = engine.close().await {
        tracing::warn!(error = %e, "failed to close database connection");
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn create(ctx: &MigrateContext, name: &str) -> Result<()> {
    let repository = ChangeSetRepository::new(&ctx.config.migrations_dir);
    let path = repository.create(name)?;

    if ctx.json {
        print_json(&serde_json::json!({ "path": path.display().to_string() }))?;
    } else {
        println!("Created migration: {}", path.display());
    }
    Ok(())
}

pub async fn next_version(ctx: &MigrateContext) -> Result<()> {
    let repository = ChangeSetRepository::new(&ctx.config.migrations_dir);
    let version = repository.next_version()?;

    if ctx.json {
        print_json(&serde_json::json!({ "next_version": version }))?;
    } else {
        println!("{}", version);
    }
    Ok(())
}

pub async fn apply(ctx: &MigrateContext) -> Result<()> {
    let mut engine = open_engine(ctx).await?;
    let outcome = engine.apply().await;
    close_quietly(engine).await;
    let report = outcome.context("Migration run failed")?;

    if ctx.json {
        print_json(&report)
    } else {
        print!("{}", render_apply(&report));
        Ok(())
    }
}

pub async fn reverse(ctx: &MigrateContext, steps: usize) -> Result<()> {
    let mut engine = open_engine(ctx).await?;
    let outcome = engine.reverse(steps).await;
    close_quietly(engine).await;
    let report = outcome.context("Reversal failed")?;

    if ctx.json {
        print_json(&report)
    } else {
        print!("{}", render_reverse(&report));
        Ok(())
    }
}

pub async fn status(ctx: &MigrateContext) -> Result<()> {
    let mut engine = open_engine(ctx).await?;
    let outcome = engine.status().await;
    close_quietly(engine).await;
    let report = outcome.context("Failed to read migration status")?;

    if ctx.json {
        print_json(&report)
    } else {
        print!("{}", render_status(&report));
        Ok(())
    }
}

pub(crate) fn render_apply(report: &ApplyReport) -> String {
    let mut out = String::new();

    for drift in &report.drift {
        let _ = writeln!(
            out,
            "⚠️  {} {} changed after it was applied (recorded {}, now {})",
            drift.version,
            drift.name,
            short_checksum(&drift.recorded_checksum),
            short_checksum(&drift.current_checksum),
        );
    }

    if report.applied_count == 0 {
        let _ = writeln!(out, "Nothing to migrate ({} already applied)", report.skipped_count);
    } else {
        let _ = writeln!(
            out,
            "Applied {} migration(s) in {}ms: {}",
            report.applied_count,
            report.execution_time_ms,
            report.applied_versions.join(", ")
        );
    }
    out
}

pub(crate) fn render_reverse(report: &ReverseReport) -> String {
    if report.reversed_count == 0 {
        "Nothing to reverse\n".to_string()
    } else {
        format!(
            "Reversed {} migration(s) in {}ms: {}\n",
            report.reversed_count,
            report.execution_time_ms,
            report.reversed_versions.join(", ")
        )
    }
}

pub(crate) fn render_status(report: &StatusReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Migration Status:");
    let _ = writeln!(out, "================");

    if report.entries.is_empty() {
        let _ = writeln!(out, "No migrations found");
        return out;
    }

    let name_width = report
        .entries
        .iter()
        .map(|e| e.name.len())
        .max()
        .unwrap_or(0);

    for entry in &report.entries {
        let icon = match entry.state {
            MigrationState::Applied => "✅",
            MigrationState::Failed => "❌",
            MigrationState::Pending => "⏳",
            MigrationState::Orphaned => "👻",
        };

        let mut line = format!(
            "  {} {}  {:<width$}",
            icon,
            entry.version,
            entry.name,
            width = name_width
        );

        if let Some(executed_at) = entry.executed_at {
            let _ = write!(line, "  {}", executed_at.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        if entry.drifted {
            line.push_str("  (file changed since applied)");
        }
        if !entry.reversible && entry.state == MigrationState::Applied {
            line.push_str("  (irreversible)");
        }
        let _ = writeln!(out, "{}", line.trim_end());

        if let Some(error) = &entry.error_message {
            let _ = writeln!(out, "      error: {}", error);
        }
    }

    let _ = writeln!(
        out,
        "\n{} applied, {} failed, {} pending, {} orphaned, {} drifted",
        report.applied, report.failed, report.pending, report.orphaned, report.drifted
    );
    let _ = writeln!(
        out,
        "✅ = Applied  ❌ = Failed  ⏳ = Pending  👻 = Applied, file removed"
    );
    out
}

fn short_checksum(checksum: &str) -> &str {
    checksum.get(..12).unwrap_or(checksum)
}
