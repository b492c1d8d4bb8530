//! PostgreSQL backend

use crate::config::Settings;
use crate::connection::connect;
use crate::executor::{DbError, Executor, PgExecutor};
use crate::migration::backend::{conflict, Backend, Resolution, StepTransaction};
use crate::migration::ledger::LedgerTable;
use crate::migration::lock::{LockGuard, PgAdvisoryLock};
use crate::migration::record::{MigrationState, StatusRecord};
use crate::migration::step::Step;
use crate::migration::MigrationError;
use crate::transaction::Transaction;
use may_postgres::Client;
use std::time::Duration;

/// Ledger, gate and step transactions on a PostgreSQL database
///
/// Uses two connections: one for step transactions and ledger reads, and
/// one that only holds the advisory lock.
pub struct PgBackend {
    executor: PgExecutor,
    lock: PgAdvisoryLock,
    ledger: LedgerTable,
}

impl PgBackend {
    /// Build a backend from two open connections and create the ledger
    /// table if it is missing
    pub fn new(
        client: Client,
        lock_client: Client,
        ledger: LedgerTable,
        lock_key: i64,
        lock_timeout: Option<Duration>,
    ) -> Result<Self, MigrationError> {
        let backend = Self {
            executor: PgExecutor::new(client),
            lock: PgAdvisoryLock::new(lock_client, lock_key, lock_timeout),
            ledger,
        };
        backend.ensure_ledger()?;
        Ok(backend)
    }

    /// Connect both sessions using `settings`
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Config` for an invalid status table or
    /// connection string, and `MigrationError::Database` if the server
    /// cannot be reached or the ledger cannot be created.
    pub fn connect(settings: &Settings) -> Result<Self, MigrationError> {
        let ledger = LedgerTable::new(settings.status_table.clone())?;
        let client = connect(&settings.database_url)?;
        let lock_client = connect(&settings.database_url)?;
        Self::new(
            client,
            lock_client,
            ledger,
            settings.lock_key,
            settings.lock_timeout(),
        )
    }

    /// Create the ledger table and its unique index if missing
    pub fn ensure_ledger(&self) -> Result<(), MigrationError> {
        self.executor.batch_execute(&self.ledger.create_sql())?;
        log::debug!("ledger table {} is ready", self.ledger.name());
        Ok(())
    }

    pub fn ledger(&self) -> &LedgerTable {
        &self.ledger
    }

    /// Executor on the migration connection, outside any step transaction
    pub fn executor(&self) -> &PgExecutor {
        &self.executor
    }
}

impl Backend for PgBackend {
    fn lock(&self) -> Result<LockGuard<'_>, MigrationError> {
        LockGuard::acquire(&self.lock)
    }

    fn records(&self) -> Result<Vec<StatusRecord>, MigrationError> {
        let rows = self
            .executor
            .query_all(&self.ledger.select_records_sql(), &[])?;
        rows.iter()
            .map(|row| StatusRecord::from_row(row).map_err(MigrationError::from))
            .collect()
    }

    fn begin(&self) -> Result<Box<dyn StepTransaction + '_>, MigrationError> {
        let tx = self.executor.begin()?;
        Ok(Box::new(PgStepTransaction {
            tx,
            ledger: &self.ledger,
        }))
    }

    fn record_failure(
        &self,
        step: &Step,
        error: &str,
        execution_ms: i64,
    ) -> Result<(), MigrationError> {
        self.executor.execute(
            &self.ledger.record_failure_sql(),
            &[&step.version, &step.name, &step.checksum, &error, &execution_ms],
        )?;
        Ok(())
    }

    fn resolve(&self, version: i64, resolution: Resolution) -> Result<(), MigrationError> {
        let sql = match resolution {
            Resolution::Applied => self.ledger.resolve_applied_sql(),
            Resolution::Pending => self.ledger.resolve_pending_sql(),
        };
        match self.executor.execute(&sql, &[&version])? {
            0 => Err(MigrationError::NothingToResolve { version }),
            _ => Ok(()),
        }
    }
}

struct PgStepTransaction<'a> {
    tx: Transaction,
    ledger: &'a LedgerTable,
}

impl PgStepTransaction<'_> {
    fn status_of(&self, version: i64) -> Result<Option<MigrationState>, MigrationError> {
        let rows = self
            .tx
            .query_all(&self.ledger.select_status_sql(), &[&version])?;
        match rows.first() {
            None => Ok(None),
            Some(row) => {
                let status: String = row.try_get(0).map_err(DbError::from)?;
                let status = status.parse::<MigrationState>().map_err(DbError::Query)?;
                Ok(Some(status))
            }
        }
    }

    /// Turn "no row matched" into a `Conflict` carrying the row's real state
    fn expect_one(&self, affected: u64, version: i64) -> Result<(), MigrationError> {
        if affected == 0 {
            return Err(conflict(version, self.status_of(version)?));
        }
        Ok(())
    }
}

impl StepTransaction for PgStepTransaction<'_> {
    fn executor(&self) -> &dyn Executor {
        &self.tx
    }

    fn start_forward(&self, step: &Step) -> Result<(), MigrationError> {
        let affected = self.tx.execute(
            &self.ledger.start_forward_sql(),
            &[&step.version, &step.name, &step.checksum],
        )?;
        self.expect_one(affected, step.version)
    }

    fn start_reverse(&self, step: &Step) -> Result<(), MigrationError> {
        let affected = self
            .tx
            .execute(&self.ledger.start_reverse_sql(), &[&step.version])?;
        self.expect_one(affected, step.version)
    }

    fn finish_forward(&self, step: &Step, execution_ms: i64) -> Result<(), MigrationError> {
        let affected = self.tx.execute(
            &self.ledger.finish_forward_sql(),
            &[&step.version, &execution_ms],
        )?;
        self.expect_one(affected, step.version)
    }

    fn finish_reverse(&self, step: &Step) -> Result<(), MigrationError> {
        let affected = self
            .tx
            .execute(&self.ledger.finish_reverse_sql(), &[&step.version])?;
        self.expect_one(affected, step.version)
    }

    fn commit(self: Box<Self>) -> Result<(), MigrationError> {
        let this = *self;
        this.tx.commit()?;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), MigrationError> {
        let this = *self;
        this.tx.rollback()?;
        Ok(())
    }
}
