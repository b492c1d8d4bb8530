//! In-memory backend for exercising the engine without PostgreSQL
//!
//! [`MemoryBackend`] keeps a ledger, a table catalogue (table name to row
//! count) and a history of committed steps behind a shared mutex. Each step
//! transaction works on a private copy of that state and publishes it on
//! commit, so a failed or dropped transaction leaves no trace.
//!
//! Step bodies run through [`MemoryExecutor`], which understands a small
//! statement vocabulary: `CREATE TABLE [IF NOT EXISTS]`, `DROP TABLE [IF
//! EXISTS]`, `INSERT INTO`, `DELETE FROM` and `SELECT` (accepted, returns
//! nothing). Any other statement fails, which is how tests provoke step
//! failures.

use crate::executor::{DbError, Executor};
use crate::migration::backend::{conflict, Backend, Resolution, StepTransaction};
use crate::migration::lock::{AdvisoryLock, LockGuard};
use crate::migration::record::{MigrationState, StatusRecord};
use crate::migration::step::Step;
use crate::migration::MigrationError;
use crate::transaction::TransactionError;
use chrono::Utc;
use may_postgres::types::ToSql;
use may_postgres::Row;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Lock key reported by [`MemoryLock`]
pub const MEMORY_LOCK_KEY: i64 = 1;

#[derive(Debug, Clone, Default)]
struct State {
    ledger: BTreeMap<i64, StatusRecord>,
    tables: BTreeMap<String, u64>,
    history: Vec<String>,
}

fn lock_state<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A gate shared by every clone of a [`MemoryBackend`]
#[derive(Debug, Default)]
pub struct MemoryLock {
    held: Mutex<bool>,
    released: Condvar,
    timeout: Option<Duration>,
    acquisitions: AtomicUsize,
}

impl MemoryLock {
    pub fn is_held(&self) -> bool {
        *lock_state(&self.held)
    }

    /// Number of successful acquisitions so far
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

impl AdvisoryLock for MemoryLock {
    fn key(&self) -> i64 {
        MEMORY_LOCK_KEY
    }

    fn acquire(&self) -> Result<(), MigrationError> {
        let held = lock_state(&self.held);
        let mut held = match self.timeout {
            None => self
                .released
                .wait_while(held, |h| *h)
                .unwrap_or_else(PoisonError::into_inner),
            Some(timeout) => {
                let (held, wait) = self
                    .released
                    .wait_timeout_while(held, timeout, |h| *h)
                    .unwrap_or_else(PoisonError::into_inner);
                if wait.timed_out() && *held {
                    return Err(MigrationError::LockTimeout {
                        key: MEMORY_LOCK_KEY,
                        seconds: timeout.as_secs(),
                    });
                }
                held
            }
        };
        *held = true;
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) -> Result<(), MigrationError> {
        let mut held = lock_state(&self.held);
        if !*held {
            return Err(MigrationError::Lock("memory lock is not held".to_string()));
        }
        *held = false;
        self.released.notify_all();
        Ok(())
    }
}

/// In-process [`Backend`]; clones share state and gate
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
    gate: Arc<MemoryLock>,
    fail_next_commit: Arc<AtomicBool>,
    fail_next_rollback: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose gate gives up after `timeout`
    pub fn with_lock_timeout(timeout: Duration) -> Self {
        Self {
            gate: Arc::new(MemoryLock {
                timeout: Some(timeout),
                ..MemoryLock::default()
            }),
            ..Self::default()
        }
    }

    pub fn gate(&self) -> &MemoryLock {
        &self.gate
    }

    /// Row count of `table`, or `None` if it does not exist
    pub fn table_rows(&self, table: &str) -> Option<u64> {
        lock_state(&self.state).tables.get(table).copied()
    }

    pub fn record(&self, version: i64) -> Option<StatusRecord> {
        lock_state(&self.state).ledger.get(&version).cloned()
    }

    /// Committed steps in commit order, as `up <version>_<name>` or
    /// `down <version>_<name>`
    pub fn history(&self) -> Vec<String> {
        lock_state(&self.state).history.clone()
    }

    /// Write a ledger row directly
    pub fn insert_record(&self, record: StatusRecord) {
        lock_state(&self.state).ledger.insert(record.version, record);
    }

    /// Make the next step commit fail
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Make the next step rollback report an error; its changes are still discarded
    pub fn fail_next_rollback(&self) {
        self.fail_next_rollback.store(true, Ordering::SeqCst);
    }
}

impl Backend for MemoryBackend {
    fn lock(&self) -> Result<LockGuard<'_>, MigrationError> {
        LockGuard::acquire(self.gate.as_ref())
    }

    fn records(&self) -> Result<Vec<StatusRecord>, MigrationError> {
        Ok(lock_state(&self.state).ledger.values().cloned().collect())
    }

    fn begin(&self) -> Result<Box<dyn StepTransaction + '_>, MigrationError> {
        let snapshot = lock_state(&self.state).clone();
        Ok(Box::new(MemoryTransaction {
            backend: self,
            executor: MemoryExecutor {
                state: RefCell::new(snapshot),
            },
        }))
    }

    fn record_failure(
        &self,
        step: &Step,
        error: &str,
        execution_ms: i64,
    ) -> Result<(), MigrationError> {
        let mut state = lock_state(&self.state);
        let now = Utc::now();
        let record = state.ledger.entry(step.version).or_insert_with(|| StatusRecord {
            version: step.version,
            name: step.name.clone(),
            checksum: step.checksum.clone(),
            status: MigrationState::Failed,
            applied_at: None,
            updated_at: now,
            execution_ms: 0,
            error_text: None,
        });
        record.status = MigrationState::Failed;
        record.updated_at = now;
        record.execution_ms = execution_ms;
        record.error_text = Some(error.to_string());
        Ok(())
    }

    fn resolve(&self, version: i64, resolution: Resolution) -> Result<(), MigrationError> {
        let mut state = lock_state(&self.state);
        let failed = state
            .ledger
            .get(&version)
            .is_some_and(|r| r.status == MigrationState::Failed);
        if !failed {
            return Err(MigrationError::NothingToResolve { version });
        }
        match resolution {
            Resolution::Pending => {
                state.ledger.remove(&version);
            }
            Resolution::Applied => {
                if let Some(record) = state.ledger.get_mut(&version) {
                    let now = Utc::now();
                    record.status = MigrationState::Applied;
                    record.applied_at = Some(now);
                    record.updated_at = now;
                    record.error_text = None;
                }
            }
        }
        Ok(())
    }
}

struct MemoryTransaction<'a> {
    backend: &'a MemoryBackend,
    executor: MemoryExecutor,
}

impl MemoryTransaction<'_> {
    fn transition(
        &self,
        version: i64,
        from: &[MigrationState],
        apply: impl FnOnce(&mut State),
    ) -> Result<(), MigrationError> {
        let mut state = self.executor.state.borrow_mut();
        let current = state.ledger.get(&version).map(|r| r.status);
        if !current.is_some_and(|s| from.contains(&s)) {
            return Err(conflict(version, current));
        }
        apply(&mut *state);
        Ok(())
    }
}

impl StepTransaction for MemoryTransaction<'_> {
    fn executor(&self) -> &dyn Executor {
        &self.executor
    }

    fn start_forward(&self, step: &Step) -> Result<(), MigrationError> {
        let mut state = self.executor.state.borrow_mut();
        let existing = state.ledger.get(&step.version);
        if let Some(record) = existing.filter(|r| r.status != MigrationState::Failed) {
            return Err(conflict(step.version, Some(record.status)));
        }
        let applied_at = existing.and_then(|r| r.applied_at);
        state.ledger.insert(
            step.version,
            StatusRecord {
                version: step.version,
                name: step.name.clone(),
                checksum: step.checksum.clone(),
                status: MigrationState::Applying,
                applied_at,
                updated_at: Utc::now(),
                execution_ms: 0,
                error_text: None,
            },
        );
        Ok(())
    }

    fn start_reverse(&self, step: &Step) -> Result<(), MigrationError> {
        self.transition(step.version, &[MigrationState::Applied], |state| {
            if let Some(record) = state.ledger.get_mut(&step.version) {
                record.status = MigrationState::Applying;
                record.updated_at = Utc::now();
            }
        })
    }

    fn finish_forward(&self, step: &Step, execution_ms: i64) -> Result<(), MigrationError> {
        self.transition(step.version, &[MigrationState::Applying], |state| {
            if let Some(record) = state.ledger.get_mut(&step.version) {
                let now = Utc::now();
                record.status = MigrationState::Applied;
                record.applied_at = Some(now);
                record.updated_at = now;
                record.execution_ms = execution_ms;
                record.error_text = None;
            }
            state.history.push(format!("up {}", step.label()));
        })
    }

    fn finish_reverse(&self, step: &Step) -> Result<(), MigrationError> {
        self.transition(step.version, &[MigrationState::Applying], |state| {
            state.ledger.remove(&step.version);
            state.history.push(format!("down {}", step.label()));
        })
    }

    fn commit(self: Box<Self>) -> Result<(), MigrationError> {
        if self.backend.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(MigrationError::Transaction(TransactionError::Other(
                "commit failed: connection reset".to_string(),
            )));
        }
        let this = *self;
        *lock_state(&this.backend.state) = this.executor.state.into_inner();
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), MigrationError> {
        if self.backend.fail_next_rollback.swap(false, Ordering::SeqCst) {
            return Err(MigrationError::Transaction(TransactionError::Other(
                "rollback failed: connection reset".to_string(),
            )));
        }
        Ok(())
    }
}

/// [`Executor`] over the private state of one in-memory transaction
#[derive(Debug, Default)]
pub struct MemoryExecutor {
    state: RefCell<State>,
}

impl MemoryExecutor {
    fn run(&self, statement: &str) -> Result<u64, DbError> {
        let words: Vec<String> = statement
            .split_whitespace()
            .map(str::to_ascii_lowercase)
            .collect();
        let words: Vec<&str> = words.iter().map(String::as_str).collect();
        let mut state = self.state.borrow_mut();
        let tables = &mut state.tables;

        match words.as_slice() {
            ["create", "table", "if", "not", "exists", name, ..] => {
                tables.entry(table_name(name)).or_insert(0);
                Ok(0)
            }
            ["create", "table", name, ..] => {
                let name = table_name(name);
                if tables.contains_key(&name) {
                    return Err(DbError::Query(format!("relation \"{name}\" already exists")));
                }
                tables.insert(name, 0);
                Ok(0)
            }
            ["drop", "table", "if", "exists", name, ..] => {
                tables.remove(&table_name(name));
                Ok(0)
            }
            ["drop", "table", name, ..] => {
                let name = table_name(name);
                tables
                    .remove(&name)
                    .map(|_| 0)
                    .ok_or_else(|| missing_relation(&name))
            }
            ["insert", "into", name, ..] => {
                let name = table_name(name);
                let rows = tables.get_mut(&name).ok_or_else(|| missing_relation(&name))?;
                *rows += 1;
                Ok(1)
            }
            ["delete", "from", name, ..] => {
                let name = table_name(name);
                let rows = tables.get_mut(&name).ok_or_else(|| missing_relation(&name))?;
                Ok(std::mem::take(rows))
            }
            ["select", ..] => Ok(0),
            _ => Err(DbError::Query(format!(
                "syntax error in statement: {}",
                statement.trim()
            ))),
        }
    }
}

impl Executor for MemoryExecutor {
    fn execute(&self, query: &str, _params: &[&dyn ToSql]) -> Result<u64, DbError> {
        self.run(query)
    }

    fn batch_execute(&self, sql: &str) -> Result<(), DbError> {
        for statement in sql.split(';').filter(|s| !s.trim().is_empty()) {
            self.run(statement)?;
        }
        Ok(())
    }

    fn query_all(&self, _query: &str, _params: &[&dyn ToSql]) -> Result<Vec<Row>, DbError> {
        Err(DbError::Other(
            "row queries are not supported by the in-memory executor".to_string(),
        ))
    }
}

fn table_name(token: &str) -> String {
    token
        .split('(')
        .next()
        .unwrap_or(token)
        .trim_matches(|c| c == ';' || c == '"')
        .to_string()
}

fn missing_relation(name: &str) -> DbError {
    DbError::Query(format!("relation \"{name}\" does not exist"))
}
