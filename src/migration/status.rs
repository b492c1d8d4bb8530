//! Migration status report: source and ledger side by side

use crate::migration::checksum::checksums_match;
use crate::migration::record::{MigrationState, StatusRecord};
use crate::migration::step::MigrationSet;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// State of one version in the report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionState {
    Applied,
    /// The last attempt failed, or a row was left mid-step
    Failed,
    /// Present in the source, absent from the ledger
    Pending,
    /// Present in the ledger, absent from the source; see
    /// [`VersionStatus::ledger_status`] for what the row says
    Orphaned,
}

impl fmt::Display for VersionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VersionState::Applied => "applied",
            VersionState::Failed => "failed",
            VersionState::Pending => "pending",
            VersionState::Orphaned => "orphaned",
        })
    }
}

/// One line of the report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionStatus {
    pub version: i64,
    pub name: String,
    pub state: VersionState,
    /// Status stored in the ledger row, `None` for pending versions
    pub ledger_status: Option<MigrationState>,
    pub applied_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub execution_ms: Option<i64>,
    pub error_text: Option<String>,
    /// The applied checksum differs from the source's
    pub drifted: bool,
}

/// Merged view of a migration source and its ledger
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationStatus {
    pub versions: Vec<VersionStatus>,
}

impl MigrationStatus {
    /// Merge `set` with ledger `records`, ordered by version
    pub fn new(set: &MigrationSet, records: &[StatusRecord]) -> Self {
        let mut merged: BTreeMap<i64, VersionStatus> = BTreeMap::new();

        for step in set.steps() {
            merged.insert(
                step.version,
                VersionStatus {
                    version: step.version,
                    name: step.name.clone(),
                    state: VersionState::Pending,
                    ledger_status: None,
                    applied_at: None,
                    updated_at: None,
                    execution_ms: None,
                    error_text: None,
                    drifted: false,
                },
            );
        }

        for record in records {
            let step = set.get(record.version);
            let state = match (step, record.status) {
                (None, _) => VersionState::Orphaned,
                (Some(_), MigrationState::Applied) => VersionState::Applied,
                (Some(_), MigrationState::Failed | MigrationState::Applying) => {
                    VersionState::Failed
                }
            };
            let drifted = record.is_applied()
                && step.is_some_and(|s| !checksums_match(&record.checksum, &s.checksum));

            merged.insert(
                record.version,
                VersionStatus {
                    version: record.version,
                    name: step.map_or_else(|| record.name.clone(), |s| s.name.clone()),
                    state,
                    ledger_status: Some(record.status),
                    applied_at: record.applied_at,
                    updated_at: Some(record.updated_at),
                    execution_ms: Some(record.execution_ms),
                    error_text: record.error_text.clone(),
                    drifted,
                },
            );
        }

        Self {
            versions: merged.into_values().collect(),
        }
    }

    fn count(&self, state: VersionState) -> usize {
        self.versions.iter().filter(|v| v.state == state).count()
    }

    pub fn applied_count(&self) -> usize {
        self.count(VersionState::Applied)
    }

    pub fn pending_count(&self) -> usize {
        self.count(VersionState::Pending)
    }

    pub fn failed_count(&self) -> usize {
        self.count(VersionState::Failed)
    }

    pub fn orphaned_count(&self) -> usize {
        self.count(VersionState::Orphaned)
    }

    /// Nothing pending and nothing failed
    pub fn is_up_to_date(&self) -> bool {
        self.pending_count() == 0 && self.failed_count() == 0
    }

    pub fn latest_applied_version(&self) -> Option<i64> {
        self.versions
            .iter()
            .filter(|v| v.state == VersionState::Applied)
            .map(|v| v.version)
            .max()
    }

    /// The version `up` would run first
    pub fn next_pending_version(&self) -> Option<i64> {
        self.versions
            .iter()
            .find(|v| matches!(v.state, VersionState::Pending | VersionState::Failed))
            .map(|v| v.version)
    }

    pub fn drifted(&self) -> impl Iterator<Item = &VersionStatus> {
        self.versions.iter().filter(|v| v.drifted)
    }
}
