//! Migration trait definition

use crate::executor::{DbError, Executor};

/// A migration written in Rust
///
/// Implementations are registered in a [`Registry`](super::Registry) and run
/// inside the step's transaction: every statement issued through `executor`
/// commits or rolls back together with the ledger update for the step.
///
/// The calls are synchronous. Under the `may` runtime the executor yields
/// the coroutine while waiting on the database.
pub trait Migration: Send + Sync {
    /// Migration version, the ordering key
    fn version(&self) -> i64;

    /// Human-readable migration name
    fn name(&self) -> &str;

    /// Apply the migration
    fn up(&self, executor: &dyn Executor) -> Result<(), DbError>;

    /// Reverse the migration
    ///
    /// The default does nothing, so rolling such a migration back only
    /// removes its ledger row.
    fn down(&self, executor: &dyn Executor) -> Result<(), DbError> {
        let _ = executor;
        Ok(())
    }
}
