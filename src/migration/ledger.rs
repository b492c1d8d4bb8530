//! SQL for the status ledger table
//!
//! The table name comes from configuration and cannot be bound as a
//! parameter, so it is validated as an identifier once, in
//! [`LedgerTable::new`], and interpolated into every statement afterwards.
//! All values are bound.

use crate::config::is_sql_identifier;
use crate::migration::MigrationError;

const COLUMNS: &str =
    "version, name, checksum, status, applied_at, updated_at, execution_ms, error_text";

/// A validated ledger table name and the statements that operate on it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerTable {
    name: String,
}

impl LedgerTable {
    /// # Errors
    ///
    /// Returns `MigrationError::Config` unless `name` is a plain or
    /// schema-qualified SQL identifier.
    pub fn new(name: impl Into<String>) -> Result<Self, MigrationError> {
        let name = name.into();
        if !is_sql_identifier(&name) {
            return Err(MigrationError::Config(format!(
                "status table '{name}' is not a valid SQL identifier"
            )));
        }
        Ok(Self { name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the unique index on `version`, without any schema prefix
    fn index_name(&self) -> String {
        let base = self.name.rsplit('.').next().unwrap_or(&self.name);
        format!("{base}_version_uq")
    }

    /// Idempotent DDL for the table and its unique index
    pub fn create_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {t} (
    id BIGSERIAL PRIMARY KEY,
    version BIGINT NOT NULL,
    name TEXT NOT NULL,
    checksum TEXT NOT NULL,
    status TEXT NOT NULL,
    applied_at TIMESTAMPTZ,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    execution_ms BIGINT DEFAULT 0,
    error_text TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS {index} ON {t} (version);",
            t = self.name,
            index = self.index_name(),
        )
    }

    /// All rows ordered by version
    pub fn select_records_sql(&self) -> String {
        format!("SELECT {COLUMNS} FROM {} ORDER BY version", self.name)
    }

    /// Status of one version: `$1` version
    pub fn select_status_sql(&self) -> String {
        format!("SELECT status FROM {} WHERE version = $1", self.name)
    }

    /// Start a forward step: `$1` version, `$2` name, `$3` checksum
    ///
    /// Inserts an `applying` row, or takes over a `failed` one. Affects no
    /// rows when the version is already applied or applying.
    pub fn start_forward_sql(&self) -> String {
        format!(
            "INSERT INTO {t} AS l (version, name, checksum, status, updated_at)
VALUES ($1, $2, $3, 'applying', now())
ON CONFLICT (version) DO UPDATE
SET name = EXCLUDED.name, checksum = EXCLUDED.checksum, status = 'applying',
    updated_at = now(), error_text = NULL
WHERE l.status = 'failed'",
            t = self.name
        )
    }

    /// Finish a forward step: `$1` version, `$2` execution_ms
    pub fn finish_forward_sql(&self) -> String {
        format!(
            "UPDATE {} SET status = 'applied', applied_at = now(), updated_at = now(),
    execution_ms = $2, error_text = NULL
WHERE version = $1 AND status = 'applying'",
            self.name
        )
    }

    /// Start a reverse step: `$1` version
    pub fn start_reverse_sql(&self) -> String {
        format!(
            "UPDATE {} SET status = 'applying', updated_at = now()
WHERE version = $1 AND status = 'applied'",
            self.name
        )
    }

    /// Finish a reverse step: `$1` version
    pub fn finish_reverse_sql(&self) -> String {
        format!(
            "DELETE FROM {} WHERE version = $1 AND status = 'applying'",
            self.name
        )
    }

    /// Record a failure outside the step's transaction:
    /// `$1` version, `$2` name, `$3` checksum, `$4` error text, `$5` execution_ms
    pub fn record_failure_sql(&self) -> String {
        format!(
            "INSERT INTO {t} AS l (version, name, checksum, status, updated_at, execution_ms, error_text)
VALUES ($1, $2, $3, 'failed', now(), $5, $4)
ON CONFLICT (version) DO UPDATE
SET status = 'failed', updated_at = now(), execution_ms = EXCLUDED.execution_ms,
    error_text = EXCLUDED.error_text",
            t = self.name
        )
    }

    /// Mark a failed row applied: `$1` version
    pub fn resolve_applied_sql(&self) -> String {
        format!(
            "UPDATE {} SET status = 'applied', applied_at = now(), updated_at = now(), error_text = NULL
WHERE version = $1 AND status = 'failed'",
            self.name
        )
    }

    /// Drop a failed row so the version is pending again: `$1` version
    pub fn resolve_pending_sql(&self) -> String {
        format!(
            "DELETE FROM {} WHERE version = $1 AND status = 'failed'",
            self.name
        )
    }
}
