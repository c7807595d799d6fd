//! Coordination Lock - one migration run per database at a time
//!
//! The lock is identified by a 64-bit key derived from a fixed name, so every
//! process configured with the same name contends for the same claim.

use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::backends::MigrationConnection;
use crate::error::{MigrateError, MigrateResult};

/// Derive the numeric lock key for a name.
///
/// The first eight bytes of SHA-256(name), with the sign bit cleared so the
/// key is a non-negative `bigint` on every backend.
pub fn lock_key(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(bytes) & (i64::MAX as u64)) as i64
}

/// Named, non-blocking, database-scoped mutual exclusion
#[derive(Debug, Clone)]
pub struct CoordinationLock {
    name: String,
    key: i64,
    lease: Duration,
}

impl CoordinationLock {
    pub fn new(name: impl Into<String>, lease: Duration) -> Self {
        let name = name.into();
        let key = lock_key(&name);
        Self { name, key, lease }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    /// Claim the lock or fail immediately with [`MigrateError::LockBusy`]
    pub async fn acquire(&self, conn: &mut dyn MigrationConnection) -> MigrateResult<()> {
        if conn.try_lock(self.key, self.lease).await? {
            tracing::debug!(lock = %self.name, key = self.key, "acquired migration lock");
            Ok(())
        } else {
            tracing::warn!(lock = %self.name, "migration lock is held by another process");
            Err(MigrateError::LockBusy {
                name: self.name.clone(),
            })
        }
    }

    /// Confirm the claim is still ours, extending its lease where applicable
    pub async fn renew(&self, conn: &mut dyn MigrationConnection) -> MigrateResult<()> {
        if conn.renew_lock(self.key, self.lease).await? {
            Ok(())
        } else {
            tracing::error!(lock = %self.name, "migration lock was lost mid-run");
            Err(MigrateError::LockLost {
                name: self.name.clone(),
            })
        }
    }

    /// Give up the claim
    pub async fn release(&self, conn: &mut dyn MigrationConnection) -> MigrateResult<()> {
        if conn.unlock(self.key).await? {
            tracing::debug!(lock = %self.name, "released migration lock");
        } else {
            tracing::warn!(lock = %self.name, "migration lock was not held at release");
        }
        Ok(())
    }
}
