//! Migration-specific error types

use crate::executor::DbError;
use crate::migration::step::Direction;
use crate::transaction::TransactionError;
use std::fmt;
use std::path::PathBuf;

/// Broad failure classes, used by callers to decide how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed migration file or duplicate version; nothing was touched
    Source,
    /// The migration gate could not be obtained; nothing was touched
    Lock,
    /// BEGIN/COMMIT/ROLLBACK or ledger I/O failed
    Transaction,
    /// A step body failed and was recorded as failed in the ledger
    StepExecution,
    /// Ledger and migration source disagree
    Consistency,
    /// The operation was cancelled between or inside steps
    Cancelled,
    /// Invalid configuration
    Config,
}

/// Migration-specific errors
#[derive(Debug)]
pub enum MigrationError {
    /// Ledger query or statement failed
    Database(DbError),
    /// Migration source could not be read or parsed
    Parse { file: PathBuf, reason: String },
    /// Two steps share a version
    DuplicateVersion { version: i64, name: String },
    /// Gate acquisition failed
    Lock(String),
    /// Gate not acquired within the configured timeout
    LockTimeout { key: i64, seconds: u64 },
    /// BEGIN/COMMIT/ROLLBACK failure
    Transaction(TransactionError),
    /// Step body failed; the ledger row is marked failed
    StepFailed {
        version: i64,
        name: String,
        direction: Direction,
        error: String,
    },
    /// The ledger references a version that the migration source does not contain
    NotFound { version: i64 },
    /// Ledger row is not in the state the operation requires
    Conflict { version: i64, status: String },
    /// An applied step's content changed after it was applied
    ChecksumMismatch {
        version: i64,
        name: String,
        stored: String,
        current: String,
    },
    /// Cancellation was requested; `version` is the step that was rolled back, if any
    Cancelled { version: Option<i64> },
    /// `resolve` was asked to reconcile a version without a failed row
    NothingToResolve { version: i64 },
    /// Invalid configuration
    Config(String),
}

impl MigrationError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            MigrationError::Parse { .. } | MigrationError::DuplicateVersion { .. } => {
                ErrorCategory::Source
            }
            MigrationError::Lock(_) | MigrationError::LockTimeout { .. } => ErrorCategory::Lock,
            MigrationError::Database(_) | MigrationError::Transaction(_) => {
                ErrorCategory::Transaction
            }
            MigrationError::StepFailed { .. } => ErrorCategory::StepExecution,
            MigrationError::NotFound { .. }
            | MigrationError::Conflict { .. }
            | MigrationError::ChecksumMismatch { .. }
            | MigrationError::NothingToResolve { .. } => ErrorCategory::Consistency,
            MigrationError::Cancelled { .. } => ErrorCategory::Cancelled,
            MigrationError::Config(_) => ErrorCategory::Config,
        }
    }
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationError::Database(e) => write!(f, "Database error: {e}"),
            MigrationError::Parse { file, reason } => {
                write!(f, "Invalid migration source {}: {reason}", file.display())
            }
            MigrationError::DuplicateVersion { version, name } => {
                write!(
                    f,
                    "Migration version {version} is defined more than once (second definition: '{name}')"
                )
            }
            MigrationError::Lock(msg) => write!(f, "Failed to acquire migration lock: {msg}"),
            MigrationError::LockTimeout { key, seconds } => {
                write!(
                    f,
                    "Migration lock {key} not acquired within {seconds} seconds.\n\
                     Another process may be running migrations. If this persists, check for:\n\
                     - Stuck migration process\n\
                     - Sessions holding pg_advisory_lock({key}) in pg_locks"
                )
            }
            MigrationError::Transaction(e) => write!(f, "Transaction error: {e}"),
            MigrationError::StepFailed {
                version,
                name,
                direction,
                error,
            } => write!(f, "{direction} {version}_{name} failed: {error}"),
            MigrationError::NotFound { version } => {
                write!(
                    f,
                    "Cannot find migration {version} to roll back.\n\
                     The ledger records it as applied but the migration source has no such version."
                )
            }
            MigrationError::Conflict { version, status } => {
                write!(f, "Migration {version} is in state '{status}' and cannot be changed by this operation")
            }
            MigrationError::ChecksumMismatch {
                version,
                name,
                stored,
                current,
            } => write!(
                f,
                "Migration '{name}' (version {version}) has been modified after being applied.\n\
                 Stored checksum: {stored}\n\
                 Current checksum: {current}"
            ),
            MigrationError::Cancelled { version: Some(v) } => {
                write!(f, "Migration run cancelled; step {v} was rolled back")
            }
            MigrationError::Cancelled { version: None } => write!(f, "Migration run cancelled"),
            MigrationError::NothingToResolve { version } => {
                write!(f, "Migration {version} has no failed ledger row to resolve")
            }
            MigrationError::Config(msg) => write!(f, "Configuration error: {msg}"),
        }
    }
}

impl std::error::Error for MigrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MigrationError::Database(e) => Some(e),
            MigrationError::Transaction(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DbError> for MigrationError {
    fn from(error: DbError) -> Self {
        MigrationError::Database(error)
    }
}

impl From<TransactionError> for MigrationError {
    fn from(error: TransactionError) -> Self {
        MigrationError::Transaction(error)
    }
}

impl From<config::ConfigError> for MigrationError {
    fn from(error: config::ConfigError) -> Self {
        MigrationError::Config(error.to_string())
    }
}

impl From<crate::connection::ConnectionError> for MigrationError {
    fn from(error: crate::connection::ConnectionError) -> Self {
        match error {
            crate::connection::ConnectionError::Postgres(e) => {
                MigrationError::Database(DbError::Postgres(e))
            }
            other => MigrationError::Config(other.to_string()),
        }
    }
}
