//! Migration Engine - applies, reverses and reports on change-sets
//!
//! `apply` and `reverse` run under the coordination lock and release it on
//! every exit path. Each change-set runs in its own transaction together with
//! the bookkeeping write, so "SQL ran" and "outcome recorded" commit as one.

use chrono::Utc;
use std::collections::HashMap;
use std::time::Instant;

use super::definitions::{
    compare_versions, ApplyReport, ChangeSet, Drift, ExecutionRecord, MigrationState, ReverseReport,
    StatusEntry, StatusReport,
};
use super::lock::CoordinationLock;
use super::repository::ChangeSetRepository;
use super::state_store::StateStore;
use crate::backends::{self, MigrationConnection};
use crate::config::MigrationConfig;
use crate::error::{MigrateError, MigrateResult};

/// Orchestrates the repository, state store and lock against one connection
pub struct MigrationEngine {
    repository: ChangeSetRepository,
    store: StateStore,
    lock: CoordinationLock,
    conn: Box<dyn MigrationConnection>,
}

impl MigrationEngine {
    pub fn new(config: &MigrationConfig, conn: Box<dyn MigrationConnection>) -> Self {
        Self {
            repository: ChangeSetRepository::new(&config.migrations_dir),
            store: StateStore::new(),
            lock: CoordinationLock::new(config.lock_name.clone(), config.lock_timeout),
            conn,
        }
    }

    /// Open a connection to `config.database_url` and build an engine on it
    pub async fn connect(config: &MigrationConfig) -> MigrateResult<Self> {
        config.validate()?;
        let url = config.require_database_url()?;
        let conn = backends::connect(url).await?;
        Ok(Self::new(config, conn))
    }

    pub fn repository(&self) -> &ChangeSetRepository {
        &self.repository
    }

    pub fn lock(&self) -> &CoordinationLock {
        &self.lock
    }

    /// The engine's connection, for callers that need to inspect the target
    pub fn connection_mut(&mut self) -> &mut dyn MigrationConnection {
        self.conn.as_mut()
    }

    pub async fn close(self) -> MigrateResult<()> {
        self.conn.close().await?;
        Ok(())
    }

    /// Apply every pending change-set in ascending version order.
    ///
    /// Stops at the first failure; the failure is recorded before the
    /// [`MigrateError::Execution`] is returned.
    pub async fn apply(&mut self) -> MigrateResult<ApplyReport> {
        let started = Instant::now();
        self.lock.acquire(self.conn.as_mut()).await?;

        let outcome = self.apply_locked().await;
        let released = self.lock.release(self.conn.as_mut()).await;

        let mut report = finish(outcome, released)?;
        report.execution_time_ms = started.elapsed().as_millis();
        Ok(report)
    }

    /// Reverse the most recent `steps` successfully applied change-sets,
    /// newest first.
    pub async fn reverse(&mut self, steps: usize) -> MigrateResult<ReverseReport> {
        let started = Instant::now();
        self.lock.acquire(self.conn.as_mut()).await?;

        let outcome = self.reverse_locked(steps).await;
        let released = self.lock.release(self.conn.as_mut()).await;

        let mut report = finish(outcome, released)?;
        report.execution_time_ms = started.elapsed().as_millis();
        Ok(report)
    }

    /// Compare files on disk with recorded executions. Does not take the lock.
    pub async fn status(&mut self) -> MigrateResult<StatusReport> {
        self.store.ensure_schema(self.conn.as_mut()).await?;
        let change_sets = self.repository.list()?;
        let records = self.store.load_all(self.conn.as_mut()).await?;
        Ok(build_status(&change_sets, &records))
    }

    async fn apply_locked(&mut self) -> MigrateResult<ApplyReport> {
        self.store.ensure_schema(self.conn.as_mut()).await?;

        let change_sets = self.repository.list()?;
        let records = self.store.load_all(self.conn.as_mut()).await?;

        let succeeded: HashMap<&str, &ExecutionRecord> = records
            .iter()
            .filter(|r| r.succeeded)
            .map(|r| (r.version.as_str(), r))
            .collect();

        let drift = detect_drift(&change_sets, &succeeded);
        for d in &drift {
            tracing::warn!(
                version = %d.version,
                name = %d.name,
                recorded = %d.recorded_checksum,
                current = %d.current_checksum,
                "migration file changed after it was applied"
            );
        }

        let latest_applied = succeeded
            .keys()
            .copied()
            .max_by(|a, b| compare_versions(a, b))
            .map(str::to_string);

        let pending: Vec<&ChangeSet> = change_sets
            .iter()
            .filter(|c| !succeeded.contains_key(c.version.as_str()))
            .collect();

        let mut report = ApplyReport {
            skipped_count: change_sets.len() - pending.len(),
            drift,
            ..ApplyReport::default()
        };

        if pending.is_empty() {
            tracing::info!("no pending migrations");
            return Ok(report);
        }

        for change_set in pending {
            if let Some(latest) = &latest_applied {
                if compare_versions(&change_set.version, latest).is_lt() {
                    tracing::warn!(
                        version = %change_set.version,
                        latest_applied = %latest,
                        "applying migration older than the latest applied version"
                    );
                }
            }

            self.lock.renew(self.conn.as_mut()).await?;
            let duration_ms = self.apply_one(change_set).await?;

            tracing::info!(
                version = %change_set.version,
                name = %change_set.name,
                duration_ms,
                "applied migration"
            );
            report.applied_versions.push(change_set.version.clone());
        }

        report.applied_count = report.applied_versions.len();
        Ok(report)
    }

    async fn apply_one(&mut self, change_set: &ChangeSet) -> MigrateResult<i64> {
        self.conn.begin().await?;

        let executed_at = Utc::now();
        let started = Instant::now();
        let execution = self.conn.execute_script(&change_set.apply_sql).await;
        let duration_ms = elapsed_ms(started);

        if let Err(e) = execution {
            return self
                .record_failure(change_set, executed_at, duration_ms, e.to_string())
                .await;
        }

        let record = ExecutionRecord::success(change_set, executed_at, duration_ms);
        if let Err(e) = self.store.upsert(self.conn.as_mut(), &record).await {
            self.rollback_quietly(&change_set.version).await;
            return Err(e);
        }

        if let Err(e) = self.conn.commit().await {
            return self
                .record_failure(
                    change_set,
                    executed_at,
                    duration_ms,
                    format!("commit failed: {}", e),
                )
                .await;
        }

        Ok(duration_ms)
    }

    async fn record_failure(
        &mut self,
        change_set: &ChangeSet,
        executed_at: chrono::DateTime<Utc>,
        duration_ms: i64,
        message: String,
    ) -> MigrateResult<i64> {
        self.rollback_quietly(&change_set.version).await;

        tracing::error!(
            version = %change_set.version,
            name = %change_set.name,
            error = %message,
            "migration failed"
        );

        let record =
            ExecutionRecord::failure(change_set, executed_at, duration_ms, message.clone());
        self.store.upsert(self.conn.as_mut(), &record).await?;

        Err(MigrateError::Execution {
            version: change_set.version.clone(),
            name: change_set.name.clone(),
            message,
        })
    }

    async fn rollback_quietly(&mut self, version: &str) {
        if let Err(e) = self.conn.rollback().await {
            tracing::error!(version = %version, error = %e, "rollback failed");
        }
    }

    async fn reverse_locked(&mut self, steps: usize) -> MigrateResult<ReverseReport> {
        let mut report = ReverseReport::default();

        if steps == 0 || !self.store.exists(self.conn.as_mut()).await? {
            return Ok(report);
        }

        let records = self.store.load_all(self.conn.as_mut()).await?;
        let batch: Vec<&ExecutionRecord> = records
            .iter()
            .filter(|r| r.succeeded)
            .rev()
            .take(steps)
            .collect();

        for record in batch {
            let reverse_sql = match record.reverse_sql.as_deref() {
                Some(sql) if !sql.trim().is_empty() => sql,
                _ => {
                    tracing::error!(
                        version = %record.version,
                        reversed = report.reversed_versions.len(),
                        "cannot reverse migration without reverse SQL"
                    );
                    return Err(MigrateError::MissingRollback {
                        version: record.version.clone(),
                    });
                }
            };

            self.lock.renew(self.conn.as_mut()).await?;
            self.reverse_one(record, reverse_sql).await?;

            tracing::info!(version = %record.version, name = %record.name, "reversed migration");
            report.reversed_versions.push(record.version.clone());
        }

        report.reversed_count = report.reversed_versions.len();
        Ok(report)
    }

    async fn reverse_one(
        &mut self,
        record: &ExecutionRecord,
        reverse_sql: &str,
    ) -> MigrateResult<()> {
        self.conn.begin().await?;

        if let Err(e) = self.conn.execute_script(reverse_sql).await {
            self.rollback_quietly(&record.version).await;
            tracing::error!(version = %record.version, error = %e, "reversal failed");
            return Err(MigrateError::Execution {
                version: record.version.clone(),
                name: record.name.clone(),
                message: e.to_string(),
            });
        }

        if let Err(e) = self.store.delete(self.conn.as_mut(), &record.version).await {
            self.rollback_quietly(&record.version).await;
            return Err(e);
        }

        if let Err(e) = self.conn.commit().await {
            self.rollback_quietly(&record.version).await;
            return Err(MigrateError::Execution {
                version: record.version.clone(),
                name: record.name.clone(),
                message: format!("commit failed: {}", e),
            });
        }

        Ok(())
    }
}

/// Combine the work outcome with the lock release; the work error wins.
fn finish<T>(outcome: MigrateResult<T>, released: MigrateResult<()>) -> MigrateResult<T> {
    match (outcome, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(release_err)) => Err(release_err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(release_err)) => {
            tracing::error!(error = %release_err, "failed to release migration lock");
            Err(err)
        }
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

fn detect_drift(
    change_sets: &[ChangeSet],
    succeeded: &HashMap<&str, &ExecutionRecord>,
) -> Vec<Drift> {
    change_sets
        .iter()
        .filter_map(|change_set| {
            let record = succeeded.get(change_set.version.as_str())?;
            (record.checksum != change_set.checksum).then(|| Drift {
                version: change_set.version.clone(),
                name: change_set.name.clone(),
                recorded_checksum: record.checksum.clone(),
                current_checksum: change_set.checksum.clone(),
            })
        })
        .collect()
}

fn build_status(change_sets: &[ChangeSet], records: &[ExecutionRecord]) -> StatusReport {
    let by_version: HashMap<&str, &ExecutionRecord> =
        records.iter().map(|r| (r.version.as_str(), r)).collect();

    let mut entries: Vec<StatusEntry> = change_sets
        .iter()
        .map(|change_set| match by_version.get(change_set.version.as_str()) {
            Some(record) => StatusEntry {
                version: change_set.version.clone(),
                name: change_set.name.clone(),
                state: if record.succeeded {
                    MigrationState::Applied
                } else {
                    MigrationState::Failed
                },
                executed_at: Some(record.executed_at),
                duration_ms: Some(record.duration_ms),
                error_message: record.error_message.clone(),
                drifted: record.succeeded && record.checksum != change_set.checksum,
                reversible: if record.succeeded {
                    record.reverse_sql.is_some()
                } else {
                    change_set.is_reversible()
                },
            },
            None => StatusEntry {
                version: change_set.version.clone(),
                name: change_set.name.clone(),
                state: MigrationState::Pending,
                executed_at: None,
                duration_ms: None,
                error_message: None,
                drifted: false,
                reversible: change_set.is_reversible(),
            },
        })
        .collect();

    let on_disk: HashMap<&str, ()> = change_sets.iter().map(|c| (c.version.as_str(), ())).collect();
    entries.extend(
        records
            .iter()
            .filter(|r| !on_disk.contains_key(r.version.as_str()))
            .map(|record| StatusEntry {
                version: record.version.clone(),
                name: record.name.clone(),
                state: if record.succeeded {
                    MigrationState::Orphaned
                } else {
                    MigrationState::Failed
                },
                executed_at: Some(record.executed_at),
                duration_ms: Some(record.duration_ms),
                error_message: record.error_message.clone(),
                drifted: false,
                reversible: record.reverse_sql.is_some(),
            }),
    );

    entries.sort_by(|a, b| compare_versions(&a.version, &b.version));
    StatusReport::from_entries(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn change_set(version: &str, checksum: &str) -> ChangeSet {
        ChangeSet {
            version: version.to_string(),
            name: format!("change {}", version),
            apply_sql: "SELECT 1".to_string(),
            reverse_sql: None,
            checksum: checksum.to_string(),
            path: PathBuf::from(format!("{}_change.sql", version)),
        }
    }

    fn record(version: &str, checksum: &str, succeeded: bool) -> ExecutionRecord {
        ExecutionRecord {
            version: version.to_string(),
            name: format!("change {}", version),
            checksum: checksum.to_string(),
            executed_at: Utc::now(),
            duration_ms: 1,
            succeeded,
            error_message: (!succeeded).then(|| "boom".to_string()),
            reverse_sql: Some("SELECT 0".to_string()),
        }
    }

    #[test]
    fn test_build_status_classifies_every_version() {
        let change_sets = vec![
            change_set("001", "aaa"),
            change_set("002", "bbb"),
            change_set("003", "ccc"),
            change_set("004", "ddd"),
        ];
        let records = vec![
            record("000", "zzz", true),
            record("001", "aaa", true),
            record("002", "changed", true),
            record("003", "ccc", false),
        ];

        let report = build_status(&change_sets, &records);

        assert_eq!(report.entry("000").unwrap().state, MigrationState::Orphaned);
        assert_eq!(report.entry("001").unwrap().state, MigrationState::Applied);
        assert!(!report.entry("001").unwrap().drifted);
        assert!(report.entry("002").unwrap().drifted);
        assert_eq!(report.entry("003").unwrap().state, MigrationState::Failed);
        assert_eq!(report.entry("003").unwrap().error_message.as_deref(), Some("boom"));
        assert_eq!(report.entry("004").unwrap().state, MigrationState::Pending);
        assert_eq!(
            (report.applied, report.failed, report.pending, report.orphaned, report.drifted),
            (2, 1, 1, 1, 1)
        );
        let versions: Vec<_> = report.entries.iter().map(|e| e.version.as_str()).collect();
        assert_eq!(versions, vec!["000", "001", "002", "003", "004"]);
    }

    #[test]
    fn test_detect_drift_ignores_failed_records() {
        let change_sets = vec![change_set("001", "new"), change_set("002", "new")];
        let records = vec![record("001", "old", true), record("002", "old", false)];
        let succeeded: HashMap<&str, &ExecutionRecord> = records
            .iter()
            .filter(|r| r.succeeded)
            .map(|r| (r.version.as_str(), r))
            .collect();

        let drift = detect_drift(&change_sets, &succeeded);
        assert_eq!(drift.len(), 1);
        assert_eq!(drift[0].version, "001");
        assert_eq!(drift[0].recorded_checksum, "old");
        assert_eq!(drift[0].current_checksum, "new");
    }

    #[test]
    fn test_finish_prefers_work_error() {
        let work: MigrateResult<()> = Err(MigrateError::MissingRollback { version: "002".into() });
        let release: MigrateResult<()> = Err(MigrateError::LockLost { name: "x".into() });
        assert!(matches!(finish(work, release), Err(MigrateError::MissingRollback { .. })));

        let release: MigrateResult<()> = Err(MigrateError::LockLost { name: "x".into() });
        assert!(matches!(finish(Ok(1), release), Err(MigrateError::LockLost { .. })));
        assert_eq!(finish(Ok(1), Ok(())).unwrap(), 1);
    }
}
