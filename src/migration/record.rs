//! `StatusRecord` - one row of the status ledger

use crate::executor::DbError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Lifecycle state stored in the ledger's `status` column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationState {
    /// A step is running inside an open transaction
    Applying,
    /// The step committed
    Applied,
    /// The step's content failed; see `error_text`
    Failed,
}

impl MigrationState {
    pub fn as_str(self) -> &'static str {
        match self {
            MigrationState::Applying => "applying",
            MigrationState::Applied => "applied",
            MigrationState::Failed => "failed",
        }
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "applying" => Ok(MigrationState::Applying),
            "applied" => Ok(MigrationState::Applied),
            "failed" => Ok(MigrationState::Failed),
            other => Err(format!("unknown migration status '{other}'")),
        }
    }
}

/// A ledger row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusRecord {
    pub version: i64,
    pub name: String,
    /// Checksum of the step when it was last written
    pub checksum: String,
    pub status: MigrationState,
    /// Set only once the step has been applied
    pub applied_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Wall-clock duration of the step's content
    pub execution_ms: i64,
    /// Set only for failed steps
    pub error_text: Option<String>,
}

impl StatusRecord {
    pub fn is_applied(&self) -> bool {
        self.status == MigrationState::Applied
    }

    /// Create a `StatusRecord` from a ledger row
    ///
    /// Columns are read by name: `version`, `name`, `checksum`, `status`,
    /// `applied_at`, `updated_at`, `execution_ms`, `error_text`.
    ///
    /// # Errors
    ///
    /// Returns `DbError` if a column is missing, has an unexpected type, or
    /// `status` holds an unknown value.
    pub fn from_row(row: &may_postgres::Row) -> Result<Self, DbError> {
        let status: String = row.try_get("status")?;
        let status = status.parse::<MigrationState>().map_err(DbError::Query)?;
        let execution_ms: Option<i64> = row.try_get("execution_ms")?;

        Ok(Self {
            version: row.try_get("version")?,
            name: row.try_get("name")?,
            checksum: row.try_get("checksum")?,
            status,
            applied_at: row.try_get("applied_at")?,
            updated_at: row.try_get("updated_at")?,
            execution_ms: execution_ms.unwrap_or(0),
            error_text: row.try_get("error_text")?,
        })
    }
}
