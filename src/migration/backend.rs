//! Storage seam between the engine and the database
//!
//! [`Backend`] owns the gate, the ledger and the connection step
//! transactions run on. [`crate::migration::PgBackend`] is the PostgreSQL
//! implementation; tests use the in-memory backend from
//! `crate::test_helpers`.

use crate::executor::Executor;
use crate::migration::lock::LockGuard;
use crate::migration::record::{MigrationState, StatusRecord};
use crate::migration::step::Step;
use crate::migration::MigrationError;
use std::collections::BTreeSet;

/// Operator decision for a version left in the failed state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The change is in place; record the version as applied
    Applied,
    /// Forget the attempt; the version becomes pending again
    Pending,
}

/// Ledger, gate and transactions for one database
pub trait Backend {
    /// Take the migration gate
    fn lock(&self) -> Result<LockGuard<'_>, MigrationError>;

    /// Every ledger row, ordered by version
    fn records(&self) -> Result<Vec<StatusRecord>, MigrationError>;

    /// Versions whose row is applied
    fn applied_versions(&self) -> Result<BTreeSet<i64>, MigrationError> {
        Ok(self
            .records()?
            .into_iter()
            .filter(StatusRecord::is_applied)
            .map(|r| r.version)
            .collect())
    }

    /// Open a transaction for one step
    fn begin(&self) -> Result<Box<dyn StepTransaction + '_>, MigrationError>;

    /// Mark `step` failed, outside any step transaction
    ///
    /// Creates the row if the failed transaction's insert was rolled back.
    fn record_failure(
        &self,
        step: &Step,
        error: &str,
        execution_ms: i64,
    ) -> Result<(), MigrationError>;

    /// Reconcile a failed row
    ///
    /// # Errors
    ///
    /// `MigrationError::NothingToResolve` unless `version` has a failed row.
    fn resolve(&self, version: i64, resolution: Resolution) -> Result<(), MigrationError>;
}

/// One step's transaction: the step's content and its ledger writes
/// commit or roll back together
///
/// Dropping the transaction without committing rolls it back.
pub trait StepTransaction {
    /// Executor bound to this transaction, handed to the step's content
    fn executor(&self) -> &dyn Executor;

    /// Write the `applying` row for a forward step
    ///
    /// # Errors
    ///
    /// `MigrationError::Conflict` if the version is already applied or
    /// applying.
    fn start_forward(&self, step: &Step) -> Result<(), MigrationError>;

    /// Move an applied row to `applying` for a reverse step
    ///
    /// # Errors
    ///
    /// `MigrationError::Conflict` if the version is not applied.
    fn start_reverse(&self, step: &Step) -> Result<(), MigrationError>;

    /// Mark the forward step applied
    fn finish_forward(&self, step: &Step, execution_ms: i64) -> Result<(), MigrationError>;

    /// Delete the row of the reversed step
    fn finish_reverse(&self, step: &Step) -> Result<(), MigrationError>;

    fn commit(self: Box<Self>) -> Result<(), MigrationError>;

    fn rollback(self: Box<Self>) -> Result<(), MigrationError>;
}

/// Build the `Conflict` error for a row found in `status`
pub(crate) fn conflict(version: i64, status: Option<MigrationState>) -> MigrationError {
    MigrationError::Conflict {
        version,
        status: status.map_or_else(|| "absent".to_string(), |s| s.to_string()),
    }
}
