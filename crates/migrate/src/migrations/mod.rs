//! Migration System
//!
//! Change-sets live on disk, execution records live in the target database,
//! and the engine reconciles the two under a database-scoped lock.

pub mod definitions;
pub mod engine;
pub mod lock;
pub mod repository;
pub mod state_store;

pub use definitions::*;
pub use engine::MigrationEngine;
pub use lock::{lock_key, CoordinationLock};
pub use repository::{
    checksum, parse_filename, ChangeSetRepository, REVERSE_BEGIN_MARKER, REVERSE_END_MARKER,
};
pub use state_store::StateStore;
