//! Migrator - core migration execution engine

use crate::migration::backend::{Backend, Resolution};
use crate::migration::cancel::CancelToken;
use crate::migration::checksum::checksums_match;
use crate::migration::record::StatusRecord;
use crate::migration::status::MigrationStatus;
use crate::migration::step::{Direction, MigrationSet, Step};
use crate::migration::MigrationError;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Reported by [`Migrator::current_version`] when nothing is applied
pub const NO_VERSION: i64 = 0;

/// Applies and rolls back steps against a [`Backend`]
///
/// Every mutating operation runs under the backend's gate and reads the
/// ledger afresh once the gate is held. Steps run one at a time, each in
/// its own transaction together with its ledger update.
///
/// # Example
///
/// ```no_run
/// use tideline::config::Settings;
/// use tideline::migration::{MigrationSource, Migrator, PgBackend, SqlDirectory};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let settings = Settings::load(None)?.validate()?;
/// let migrator = Migrator::new(PgBackend::connect(&settings)?);
/// let set = SqlDirectory::new(&settings.path).load()?;
/// let applied = migrator.up(&set)?;
/// println!("applied {applied} migration(s), now at {}", migrator.current_version()?);
/// # Ok(())
/// # }
/// ```
pub struct Migrator<B> {
    backend: B,
    verify_checksums: bool,
    cancel: CancelToken,
}

impl<B: Backend> Migrator<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            verify_checksums: true,
            cancel: CancelToken::new(),
        }
    }

    /// Refuse to run `up`/`redo` when an applied step changed since it was
    /// applied (on by default)
    pub fn with_checksum_verification(mut self, enabled: bool) -> Self {
        self.verify_checksums = enabled;
        self
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Apply every pending step in ascending version order
    ///
    /// Versions whose last attempt failed count as pending. Stops at the
    /// first failing step; steps committed before it stay applied.
    ///
    /// Returns the number of steps applied.
    pub fn up(&self, set: &MigrationSet) -> Result<usize, MigrationError> {
        let _guard = self.backend.lock()?;
        self.up_locked(set)
    }

    /// Roll back the highest applied version
    ///
    /// Returns the rolled-back version, or `None` when nothing is applied.
    ///
    /// # Errors
    ///
    /// `MigrationError::NotFound` when the highest applied version has no
    /// step in `set`.
    pub fn down(&self, set: &MigrationSet) -> Result<Option<i64>, MigrationError> {
        let _guard = self.backend.lock()?;
        self.down_locked(set)
    }

    /// Roll back the highest applied version, then apply everything
    /// pending, all under one gate hold
    pub fn redo(&self, set: &MigrationSet) -> Result<Option<i64>, MigrationError> {
        let _guard = self.backend.lock()?;
        if self.verify_checksums {
            verify_checksums(set, &self.backend.records()?)?;
        }
        let reverted = self.down_locked(set)?;
        let applied = self.up_locked(set)?;
        log::info!("redo complete: rolled back {reverted:?}, applied {applied} step(s)");
        Ok(reverted)
    }

    /// Ledger rows ordered by version
    pub fn status(&self) -> Result<Vec<StatusRecord>, MigrationError> {
        self.backend.records()
    }

    /// Highest applied version, or [`NO_VERSION`]
    pub fn current_version(&self) -> Result<i64, MigrationError> {
        Ok(self
            .backend
            .applied_versions()?
            .last()
            .copied()
            .unwrap_or(NO_VERSION))
    }

    /// Compare `set` with the ledger
    pub fn report(&self, set: &MigrationSet) -> Result<MigrationStatus, MigrationError> {
        Ok(MigrationStatus::new(set, &self.backend.records()?))
    }

    /// Check every applied step's stored checksum against `set`
    ///
    /// Runs regardless of [`Migrator::with_checksum_verification`]. Returns
    /// the number of applied steps checked.
    pub fn validate(&self, set: &MigrationSet) -> Result<usize, MigrationError> {
        let checked = verify_checksums(set, &self.backend.records()?)?;
        log::info!("checksums of {checked} applied migration(s) match");
        Ok(checked)
    }

    /// Reconcile a version left in the failed state
    pub fn resolve(&self, version: i64, resolution: Resolution) -> Result<(), MigrationError> {
        let _guard = self.backend.lock()?;
        self.backend.resolve(version, resolution)?;
        log::info!("resolved failed migration {version} as {resolution:?}");
        Ok(())
    }

    fn up_locked(&self, set: &MigrationSet) -> Result<usize, MigrationError> {
        let records = self.backend.records()?;
        if self.verify_checksums {
            verify_checksums(set, &records)?;
        }

        let applied: BTreeSet<i64> = records
            .iter()
            .filter(|r| r.is_applied())
            .map(|r| r.version)
            .collect();
        let pending: Vec<&Step> = set
            .steps()
            .iter()
            .filter(|s| !applied.contains(&s.version))
            .collect();

        if pending.is_empty() {
            log::info!("database is up to date");
            return Ok(0);
        }

        log::info!("{} pending migration(s)", pending.len());
        for (count, step) in pending.iter().enumerate() {
            if self.cancel.is_cancelled() {
                log::warn!("cancelled after applying {count} migration(s)");
                return Err(MigrationError::Cancelled { version: None });
            }
            self.apply(step, Direction::Up)?;
        }
        Ok(pending.len())
    }

    fn down_locked(&self, set: &MigrationSet) -> Result<Option<i64>, MigrationError> {
        let Some(target) = self.backend.applied_versions()?.last().copied() else {
            log::info!("no applied migrations to roll back");
            return Ok(None);
        };
        let step = set
            .get(target)
            .ok_or(MigrationError::NotFound { version: target })?;
        if self.cancel.is_cancelled() {
            return Err(MigrationError::Cancelled { version: None });
        }
        self.apply(step, Direction::Down)?;
        Ok(Some(target))
    }

    /// Run one step and its ledger update in a single transaction
    fn apply(&self, step: &Step, direction: Direction) -> Result<(), MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::step_span(step.version, direction.as_str()).entered();

        let tx = self.backend.begin()?;
        match direction {
            Direction::Up => tx.start_forward(step)?,
            Direction::Down => tx.start_reverse(step)?,
        }

        let started = Instant::now();
        let outcome = step.run(direction, tx.executor());
        let elapsed = started.elapsed();
        let execution_ms = i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX);

        if let Err(e) = outcome {
            let error = e.to_string();
            if let Err(rollback_error) = tx.rollback() {
                log::warn!("rollback of {} failed: {rollback_error}", step.label());
            }
            if let Err(record_error) = self.backend.record_failure(step, &error, execution_ms) {
                log::warn!("could not mark {} as failed: {record_error}", step.label());
            }
            observe(direction, "failed", elapsed);
            log::error!("{direction} {} failed: {error}", step.label());
            return Err(MigrationError::StepFailed {
                version: step.version,
                name: step.name.clone(),
                direction,
                error,
            });
        }

        if self.cancel.is_cancelled() {
            if let Err(rollback_error) = tx.rollback() {
                log::warn!("rollback of cancelled {} failed: {rollback_error}", step.label());
            }
            observe(direction, "cancelled", elapsed);
            log::warn!("cancelled during {direction} {}, rolled back", step.label());
            return Err(MigrationError::Cancelled {
                version: Some(step.version),
            });
        }

        match direction {
            Direction::Up => tx.finish_forward(step, execution_ms)?,
            Direction::Down => tx.finish_reverse(step)?,
        }
        tx.commit()?;
        observe(direction, "success", elapsed);

        match direction {
            Direction::Up => log::info!("applied {} ({execution_ms} ms)", step.label()),
            Direction::Down => log::info!("rolled back {} ({execution_ms} ms)", step.label()),
        }
        Ok(())
    }
}

#[cfg(feature = "metrics")]
fn observe(direction: Direction, outcome: &'static str, elapsed: Duration) {
    METRICS.record_step(direction.as_str(), outcome, elapsed);
}

#[cfg(not(feature = "metrics"))]
fn observe(_direction: Direction, _outcome: &'static str, _elapsed: Duration) {}

/// Fail on the first applied row whose checksum differs from its step
///
/// Rows without a step are left to `down`, which reports them as
/// `NotFound` if it reaches them.
fn verify_checksums(set: &MigrationSet, records: &[StatusRecord]) -> Result<usize, MigrationError> {
    let mut checked = 0;
    for record in records.iter().filter(|r| r.is_applied()) {
        let Some(step) = set.get(record.version) else {
            continue;
        };
        if !checksums_match(&record.checksum, &step.checksum) {
            return Err(MigrationError::ChecksumMismatch {
                version: record.version,
                name: step.name.clone(),
                stored: record.checksum.clone(),
                current: step.checksum.clone(),
            });
        }
        checked += 1;
    }
    Ok(checked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{DbError, Executor};
    use crate::migration::record::MigrationState;
    use crate::migration::{ErrorCategory, Migration, Registry};
    use crate::test_helpers::MemoryBackend;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn init() -> Step {
        Step::sql(1000, "init", "CREATE TABLE foo (id INT);", "DROP TABLE foo;")
    }

    fn seed() -> Step {
        Step::sql(2000, "seed", "INSERT INTO foo VALUES (1);", "DELETE FROM foo;")
    }

    fn two_step_set() -> MigrationSet {
        MigrationSet::new(vec![seed(), init()]).unwrap()
    }

    fn migrator() -> Migrator<MemoryBackend> {
        Migrator::new(MemoryBackend::new())
    }

    fn statuses(m: &Migrator<MemoryBackend>) -> Vec<(i64, MigrationState)> {
        m.status()
            .unwrap()
            .into_iter()
            .map(|r| (r.version, r.status))
            .collect()
    }

    #[test]
    fn test_up_down_redo_scenario() {
        let m = migrator();
        let set = two_step_set();

        assert_eq!(m.up(&set).unwrap(), 2);
        assert_eq!(m.backend().table_rows("foo"), Some(1));
        assert_eq!(m.current_version().unwrap(), 2000);
        assert_eq!(
            statuses(&m),
            vec![(1000, MigrationState::Applied), (2000, MigrationState::Applied)]
        );

        assert_eq!(m.down(&set).unwrap(), Some(2000));
        assert_eq!(m.backend().table_rows("foo"), Some(0));
        assert_eq!(statuses(&m), vec![(1000, MigrationState::Applied)]);
        assert_eq!(m.current_version().unwrap(), 1000);

        assert_eq!(m.down(&set).unwrap(), Some(1000));
        assert_eq!(m.backend().table_rows("foo"), None);
        assert!(m.status().unwrap().is_empty());
        assert_eq!(m.current_version().unwrap(), NO_VERSION);

        assert_eq!(m.up(&set).unwrap(), 2);
        assert_eq!(m.redo(&set).unwrap(), Some(2000));
        assert_eq!(m.backend().table_rows("foo"), Some(1));
        assert_eq!(m.current_version().unwrap(), 2000);
    }

    #[test]
    fn test_redo_after_up_matches_single_up() {
        let once = migrator();
        once.up(&two_step_set()).unwrap();

        let redone = migrator();
        redone.up(&two_step_set()).unwrap();
        redone.redo(&two_step_set()).unwrap();

        assert_eq!(once.backend().table_rows("foo"), redone.backend().table_rows("foo"));
        assert_eq!(statuses(&once), statuses(&redone));
    }

    #[test]
    fn test_up_is_idempotent() {
        let m = migrator();
        let set = two_step_set();
        assert_eq!(m.up(&set).unwrap(), 2);
        let first = statuses(&m);
        assert_eq!(m.up(&set).unwrap(), 0);
        assert_eq!(statuses(&m), first);
        assert_eq!(m.backend().table_rows("foo"), Some(1));
        assert_eq!(m.backend().history().len(), 2);
    }

    #[test]
    fn test_up_applies_in_ascending_order_for_any_input_order() {
        let steps = vec![
            Step::sql(30, "c", "CREATE TABLE c (id INT)", ""),
            Step::sql(4, "a", "CREATE TABLE a (id INT)", ""),
            Step::sql(200, "d", "CREATE TABLE d (id INT)", ""),
            Step::sql(10, "b", "CREATE TABLE b (id INT)", ""),
        ];
        let orders = [[0, 1, 2, 3], [3, 2, 1, 0], [2, 0, 3, 1], [1, 3, 0, 2]];
        for order in orders {
            let m = migrator();
            let set = MigrationSet::new(order.iter().map(|&i| steps[i].clone()).collect()).unwrap();
            m.up(&set).unwrap();
            assert_eq!(
                m.backend().history(),
                vec!["up 4_a", "up 10_b", "up 30_c", "up 200_d"]
            );
        }
    }

    #[test]
    fn test_failed_step_is_atomic_and_recorded() {
        let m = migrator();
        let set = MigrationSet::new(vec![
            init(),
            Step::sql(
                2000,
                "broken",
                "CREATE TABLE bar (id INT); INSERT INTO missing VALUES (1);",
                "",
            ),
            Step::sql(3000, "never", "CREATE TABLE baz (id INT)", ""),
        ])
        .unwrap();

        let err = m.up(&set).unwrap_err();
        match &err {
            MigrationError::StepFailed {
                version,
                name,
                direction,
                error,
            } => {
                assert_eq!(*version, 2000);
                assert_eq!(name, "broken");
                assert_eq!(*direction, Direction::Up);
                assert!(error.contains("missing"), "{error}");
            }
            other => panic!("Expected StepFailed, got {other:?}"),
        }
        assert_eq!(err.category(), ErrorCategory::StepExecution);

        // the failed step's own changes were rolled back, later steps never ran
        assert_eq!(m.backend().table_rows("bar"), None);
        assert_eq!(m.backend().table_rows("baz"), None);
        assert_eq!(m.backend().table_rows("foo"), Some(0));

        let failed = m.backend().record(2000).unwrap();
        assert_eq!(failed.status, MigrationState::Failed);
        assert!(failed.applied_at.is_none());
        assert!(failed.error_text.unwrap().contains("missing"));
        assert_eq!(m.current_version().unwrap(), 1000);
    }

    #[test]
    fn test_up_retries_failed_version_once_fixed() {
        let m = migrator();
        let broken = MigrationSet::new(vec![Step::sql(1000, "init", "CREATE TABLE", "")]).unwrap();
        assert!(m.up(&broken).is_err());
        assert_eq!(
            m.backend().record(1000).map(|r| r.status),
            Some(MigrationState::Failed)
        );

        let fixed = MigrationSet::new(vec![init()]).unwrap();
        assert_eq!(m.up(&fixed).unwrap(), 1);
        let record = m.backend().record(1000).unwrap();
        assert_eq!(record.status, MigrationState::Applied);
        assert_eq!(record.checksum, init().checksum);
        assert!(record.error_text.is_none());
        assert!(record.applied_at.is_some());
    }

    #[test]
    fn test_down_targets_maximum_applied_version() {
        let m = migrator();
        let set = MigrationSet::new(vec![
            Step::sql(2000, "second", "CREATE TABLE two (id INT)", "DROP TABLE two"),
            Step::sql(1000, "first", "CREATE TABLE one (id INT)", "DROP TABLE one"),
        ])
        .unwrap();
        m.up(&set).unwrap();

        assert_eq!(m.down(&set).unwrap(), Some(2000));
        assert_eq!(m.backend().table_rows("two"), None);
        assert_eq!(m.backend().table_rows("one"), Some(0));
        assert_eq!(statuses(&m), vec![(1000, MigrationState::Applied)]);
    }

    #[test]
    fn test_down_with_nothing_applied_is_a_no_op() {
        let m = migrator();
        assert_eq!(m.down(&two_step_set()).unwrap(), None);
        assert!(m.backend().history().is_empty());
    }

    #[test]
    fn test_down_fails_when_source_lost_the_version() {
        let m = migrator();
        m.up(&two_step_set()).unwrap();

        let shrunk = MigrationSet::new(vec![init()]).unwrap();
        let err = m.down(&shrunk).unwrap_err();
        assert!(matches!(err, MigrationError::NotFound { version: 2000 }));
        assert_eq!(err.category(), ErrorCategory::Consistency);
        assert_eq!(m.current_version().unwrap(), 2000);
    }

    #[test]
    fn test_failed_rollback_keeps_row_as_failed() {
        let m = migrator();
        let set = MigrationSet::new(vec![Step::sql(
            1000,
            "init",
            "CREATE TABLE foo (id INT)",
            "DROP TABLE nope",
        )])
        .unwrap();
        m.up(&set).unwrap();

        let err = m.down(&set).unwrap_err();
        assert!(matches!(
            err,
            MigrationError::StepFailed { version: 1000, direction: Direction::Down, .. }
        ));
        let record = m.backend().record(1000).unwrap();
        assert_eq!(record.status, MigrationState::Failed);
        assert!(record.error_text.is_some());
        assert_eq!(m.backend().table_rows("foo"), Some(0));
        assert_eq!(m.current_version().unwrap(), NO_VERSION);
    }

    #[test]
    fn test_empty_bodies_are_recorded_as_applied() {
        let m = migrator();
        let set = MigrationSet::new(vec![Step::sql(1000, "placeholder", "", "")]).unwrap();
        assert_eq!(m.up(&set).unwrap(), 1);
        assert_eq!(m.current_version().unwrap(), 1000);
        assert_eq!(m.down(&set).unwrap(), Some(1000));
        assert!(m.status().unwrap().is_empty());
    }

    #[test]
    fn test_code_migrations_run_in_step_transaction() {
        let mut registry = Registry::new();
        registry
            .register_fn(
                1000,
                "create_users",
                |tx| tx.batch_execute("CREATE TABLE users (id INT)"),
                |tx| tx.batch_execute("DROP TABLE users"),
            )
            .unwrap();
        registry
            .register_fn(
                2000,
                "seed_users",
                |tx| {
                    tx.execute("INSERT INTO users VALUES ($1)", &[&1i32])?;
                    tx.execute("INSERT INTO users VALUES ($1)", &[&2i32])?;
                    Ok(())
                },
                |_| Ok(()),
            )
            .unwrap();

        let m = migrator();
        let set = registry.load().unwrap();
        assert_eq!(m.up(&set).unwrap(), 2);
        assert_eq!(m.backend().table_rows("users"), Some(2));

        // down defaults to a no-op for the seed step
        assert_eq!(m.down(&set).unwrap(), Some(2000));
        assert_eq!(m.backend().table_rows("users"), Some(2));
    }

    #[test]
    fn test_drift_blocks_up_and_redo_but_not_down() {
        let m = migrator();
        m.up(&two_step_set()).unwrap();

        let edited = MigrationSet::new(vec![
            Step::sql(1000, "init", "CREATE TABLE foo (id BIGINT);", "DROP TABLE foo;"),
            seed(),
            Step::sql(3000, "more", "CREATE TABLE more (id INT)", ""),
        ])
        .unwrap();

        for result in [m.up(&edited).map(|_| ()), m.redo(&edited).map(|_| ())] {
            match result {
                Err(MigrationError::ChecksumMismatch { version, stored, current, .. }) => {
                    assert_eq!(version, 1000);
                    assert_eq!(stored, init().checksum);
                    assert_ne!(stored, current);
                }
                other => panic!("Expected ChecksumMismatch, got {other:?}"),
            }
        }
        assert!(m.validate(&edited).is_err());
        assert_eq!(m.backend().table_rows("more"), None);
        assert_eq!(m.current_version().unwrap(), 2000);

        assert_eq!(m.down(&edited).unwrap(), Some(2000));
    }

    #[test]
    fn test_drift_allowed_when_verification_disabled() {
        let m = migrator().with_checksum_verification(false);
        m.up(&two_step_set()).unwrap();
        let edited = MigrationSet::new(vec![
            Step::sql(1000, "init", "CREATE TABLE foo (id BIGINT);", "DROP TABLE foo;"),
            seed(),
            Step::sql(3000, "more", "CREATE TABLE more (id INT)", ""),
        ])
        .unwrap();
        assert_eq!(m.up(&edited).unwrap(), 1);
        assert!(matches!(
            m.validate(&edited),
            Err(MigrationError::ChecksumMismatch { version: 1000, .. })
        ));
    }

    #[test]
    fn test_validate_counts_applied_steps() {
        let m = migrator();
        let set = two_step_set();
        assert_eq!(m.validate(&set).unwrap(), 0);
        m.up(&set).unwrap();
        assert_eq!(m.validate(&set).unwrap(), 2);
    }

    #[test]
    fn test_report_includes_orphans_and_pending() {
        let m = migrator();
        m.backend().insert_record(StatusRecord {
            version: 500,
            name: "legacy".to_string(),
            checksum: "0".to_string(),
            status: MigrationState::Applied,
            applied_at: Some(Utc::now()),
            updated_at: Utc::now(),
            execution_ms: 0,
            error_text: None,
        });
        m.up(&MigrationSet::new(vec![init()]).unwrap()).unwrap();

        let report = m.report(&two_step_set()).unwrap();
        assert_eq!(report.orphaned_count(), 1);
        assert_eq!(report.applied_count(), 1);
        assert_eq!(report.pending_count(), 1);
        assert_eq!(report.next_pending_version(), Some(2000));
    }

    #[test]
    fn test_resolve_failed_version() {
        let m = migrator();
        let broken = MigrationSet::new(vec![Step::sql(1000, "init", "DROP TABLE nope", "")]).unwrap();
        m.up(&broken).unwrap_err();

        m.resolve(1000, Resolution::Applied).unwrap();
        assert_eq!(m.current_version().unwrap(), 1000);
        assert!(m.backend().record(1000).unwrap().error_text.is_none());

        assert!(matches!(
            m.resolve(1000, Resolution::Applied),
            Err(MigrationError::NothingToResolve { version: 1000 })
        ));
        assert!(matches!(
            m.resolve(4242, Resolution::Pending),
            Err(MigrationError::NothingToResolve { version: 4242 })
        ));
    }

    #[test]
    fn test_resolve_as_pending_removes_row() {
        let m = migrator();
        let broken = MigrationSet::new(vec![Step::sql(1000, "init", "DROP TABLE nope", "")]).unwrap();
        m.up(&broken).unwrap_err();

        m.resolve(1000, Resolution::Pending).unwrap();
        assert!(m.backend().record(1000).is_none());
        assert_eq!(m.up(&MigrationSet::new(vec![init()]).unwrap()).unwrap(), 1);
    }

    struct CancelMidStep {
        token: CancelToken,
    }

    impl Migration for CancelMidStep {
        fn version(&self) -> i64 {
            2000
        }
        fn name(&self) -> &str {
            "cancel_mid_step"
        }
        fn up(&self, executor: &dyn Executor) -> Result<(), DbError> {
            executor.batch_execute("CREATE TABLE half (id INT)")?;
            self.token.cancel();
            Ok(())
        }
    }

    #[test]
    fn test_cancel_mid_step_rolls_back_only_that_step() {
        let token = CancelToken::new();
        let m = migrator().with_cancel_token(token.clone());
        let set = MigrationSet::new(vec![
            init(),
            Step::code(Arc::new(CancelMidStep { token })),
            Step::sql(3000, "after", "CREATE TABLE after (id INT)", ""),
        ])
        .unwrap();

        let err = m.up(&set).unwrap_err();
        assert!(matches!(err, MigrationError::Cancelled { version: Some(2000) }));
        assert_eq!(err.category(), ErrorCategory::Cancelled);
        assert_eq!(m.backend().table_rows("foo"), Some(0));
        assert_eq!(m.backend().table_rows("half"), None);
        assert_eq!(m.backend().table_rows("after"), None);
        assert!(m.backend().record(2000).is_none());
        assert_eq!(m.current_version().unwrap(), 1000);
    }

    #[test]
    fn test_cancel_reported_even_if_rollback_fails() {
        let token = CancelToken::new();
        let m = migrator().with_cancel_token(token.clone());
        let set = MigrationSet::new(vec![Step::code(Arc::new(CancelMidStep { token }))]).unwrap();
        m.backend().fail_next_rollback();

        let err = m.up(&set).unwrap_err();
        assert!(matches!(err, MigrationError::Cancelled { version: Some(2000) }));
        assert!(m.backend().record(2000).is_none());
        assert!(!m.backend().gate().is_held());
    }

    #[test]
    fn test_cancel_before_run_applies_nothing() {
        let m = migrator();
        m.cancel_token().cancel();
        assert!(matches!(
            m.up(&two_step_set()),
            Err(MigrationError::Cancelled { version: None })
        ));
        assert!(m.status().unwrap().is_empty());
        assert!(!m.backend().gate().is_held());
    }

    #[test]
    fn test_commit_failure_leaves_no_trace() {
        let m = migrator();
        m.backend().fail_next_commit();
        let err = m.up(&two_step_set()).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Transaction);
        assert!(m.status().unwrap().is_empty());
        assert_eq!(m.backend().table_rows("foo"), None);
        assert_eq!(m.up(&two_step_set()).unwrap(), 2);
    }

    #[test]
    fn test_redo_holds_the_gate_once() {
        let m = migrator();
        let set = two_step_set();
        m.up(&set).unwrap();
        let before = m.backend().gate().acquisitions();

        assert_eq!(m.redo(&set).unwrap(), Some(2000));
        assert_eq!(m.backend().gate().acquisitions(), before + 1);
        assert!(!m.backend().gate().is_held());
        assert_eq!(m.backend().table_rows("foo"), Some(1));
    }

    #[test]
    fn test_gate_released_after_step_failure() {
        let m = migrator();
        let broken = MigrationSet::new(vec![Step::sql(1000, "init", "DROP TABLE nope", "")]).unwrap();
        assert!(m.up(&broken).is_err());
        assert!(!m.backend().gate().is_held());
    }

    struct Explodes;

    impl Migration for Explodes {
        fn version(&self) -> i64 {
            1000
        }
        fn name(&self) -> &str {
            "explodes"
        }
        fn up(&self, executor: &dyn Executor) -> Result<(), DbError> {
            executor.batch_execute("CREATE TABLE foo (id INT)")?;
            panic!("migration code panicked");
        }
    }

    #[test]
    fn test_gate_released_and_step_rolled_back_on_panic() {
        let m = migrator();
        let set = MigrationSet::new(vec![Step::code(Arc::new(Explodes))]).unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| m.up(&set)));
        assert!(result.is_err());
        assert!(!m.backend().gate().is_held());
        assert_eq!(m.backend().table_rows("foo"), None);
        assert!(m.status().unwrap().is_empty());

        assert_eq!(m.up(&two_step_set()).unwrap(), 2);
    }

    #[test]
    fn test_lock_timeout_surfaces_as_lock_error() {
        let backend = MemoryBackend::with_lock_timeout(Duration::from_millis(20));
        let m = Migrator::new(backend.clone());
        let _held = backend.lock().unwrap();

        let err = m.up(&two_step_set()).unwrap_err();
        assert!(matches!(err, MigrationError::LockTimeout { .. }));
        assert_eq!(err.category(), ErrorCategory::Lock);
        assert!(m.status().unwrap().is_empty());
    }

    #[test]
    fn test_operations_wait_for_the_gate() {
        let backend = MemoryBackend::new();
        let guard = backend.lock().unwrap();

        let worker = {
            let backend = backend.clone();
            thread::spawn(move || Migrator::new(backend).up(&two_step_set()))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(backend.records().unwrap().is_empty());

        drop(guard);
        assert_eq!(worker.join().unwrap().unwrap(), 2);
        assert_eq!(backend.table_rows("foo"), Some(1));
    }

    #[test]
    fn test_concurrent_up_applies_each_version_once() {
        let backend = MemoryBackend::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new();
        {
            let runs = Arc::clone(&runs);
            registry
                .register_fn(
                    1000,
                    "count",
                    move |tx| {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tx.batch_execute("CREATE TABLE counted (id INT)")
                    },
                    |_| Ok(()),
                )
                .unwrap();
        }
        let set = Arc::new(registry.load().unwrap());
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let backend = backend.clone();
                let set = Arc::clone(&set);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    Migrator::new(backend).up(&set)
                })
            })
            .collect();
        let applied: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .sum();

        assert_eq!(applied, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(backend.table_rows("counted"), Some(0));
        assert_eq!(backend.gate().acquisitions(), 4);
    }
}
