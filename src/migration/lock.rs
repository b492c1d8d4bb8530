//! Cross-process mutual exclusion for migration runs
//!
//! The PostgreSQL gate is a session-level advisory lock taken on its own
//! connection, separate from the one that runs step transactions, so
//! rolling a step back never releases it.

use crate::executor::{DbError, Executor, PgExecutor};
use crate::migration::MigrationError;
use may_postgres::Client;
use std::time::{Duration, Instant};

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Poll interval while waiting for a lock with a timeout
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A named, exclusive, cross-process lock
pub trait AdvisoryLock {
    /// Integer key identifying the lock
    fn key(&self) -> i64;

    /// Block until the lock is held
    fn acquire(&self) -> Result<(), MigrationError>;

    /// Release a held lock
    fn release(&self) -> Result<(), MigrationError>;
}

/// Holds an [`AdvisoryLock`] and releases it when dropped
///
/// Release runs on every exit path, including errors and unwinding panics.
/// A failed release is logged and otherwise ignored.
pub struct LockGuard<'a> {
    lock: &'a dyn AdvisoryLock,
}

impl<'a> LockGuard<'a> {
    /// Acquire `lock` and wrap it in a guard
    ///
    /// # Errors
    ///
    /// Propagates the lock's acquisition error (`Lock` or `LockTimeout`).
    pub fn acquire(lock: &'a dyn AdvisoryLock) -> Result<Self, MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::lock_span(lock.key()).entered();

        let start = Instant::now();
        lock.acquire()?;
        let waited = start.elapsed();

        #[cfg(feature = "metrics")]
        METRICS.observe_lock_wait(waited);
        log::info!("acquired migration lock {} after {waited:?}", lock.key());

        Ok(Self { lock })
    }

    pub fn key(&self) -> i64 {
        self.lock.key()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        match self.lock.release() {
            Ok(()) => log::debug!("released migration lock {}", self.lock.key()),
            Err(e) => log::warn!("failed to release migration lock {}: {e}", self.lock.key()),
        }
    }
}

/// Run `f` while holding `lock`
///
/// # Errors
///
/// Returns the acquisition error, or whatever `f` returns.
pub fn with_lock<T>(
    lock: &dyn AdvisoryLock,
    f: impl FnOnce() -> Result<T, MigrationError>,
) -> Result<T, MigrationError> {
    let _guard = LockGuard::acquire(lock)?;
    f()
}

/// PostgreSQL session-level advisory lock on a dedicated connection
pub struct PgAdvisoryLock {
    executor: PgExecutor,
    key: i64,
    timeout: Option<Duration>,
}

impl PgAdvisoryLock {
    /// `client` must not be shared with step transactions
    ///
    /// Without a timeout, acquisition blocks in `pg_advisory_lock` until the
    /// current holder releases. With one, `pg_try_advisory_lock` is polled
    /// every [`LOCK_POLL_INTERVAL`].
    pub fn new(client: Client, key: i64, timeout: Option<Duration>) -> Self {
        Self {
            executor: PgExecutor::new(client),
            key,
            timeout,
        }
    }

    fn try_acquire(&self) -> Result<bool, DbError> {
        let rows = self
            .executor
            .query_all("SELECT pg_try_advisory_lock($1)", &[&self.key])?;
        let row = rows
            .first()
            .ok_or_else(|| DbError::Query("pg_try_advisory_lock returned no rows".to_string()))?;
        Ok(row.try_get::<_, bool>(0)?)
    }

    fn poll(&self, timeout: Duration) -> Result<(), MigrationError> {
        let start = Instant::now();
        loop {
            if self.try_acquire().map_err(|e| MigrationError::Lock(e.to_string()))? {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(MigrationError::LockTimeout {
                    key: self.key,
                    seconds: timeout.as_secs(),
                });
            }
            log::debug!("migration lock {} is held elsewhere, retrying", self.key);
            std::thread::sleep(LOCK_POLL_INTERVAL);
        }
    }
}

impl AdvisoryLock for PgAdvisoryLock {
    fn key(&self) -> i64 {
        self.key
    }

    fn acquire(&self) -> Result<(), MigrationError> {
        match self.timeout {
            Some(timeout) => self.poll(timeout),
            None => self
                .executor
                .query_all("SELECT pg_advisory_lock($1)", &[&self.key])
                .map(|_| ())
                .map_err(|e| MigrationError::Lock(e.to_string())),
        }
    }

    fn release(&self) -> Result<(), MigrationError> {
        let rows = self
            .executor
            .query_all("SELECT pg_advisory_unlock($1)", &[&self.key])?;
        let released = match rows.first() {
            Some(row) => row.try_get::<_, bool>(0).map_err(DbError::from)?,
            None => false,
        };
        if released {
            Ok(())
        } else {
            Err(MigrationError::Lock(format!(
                "advisory lock {} was not held by this session",
                self.key
            )))
        }
    }
}
