//! Statement execution over `may_postgres`.
//!
//! [`Executor`] is the seam every database interaction goes through: the
//! ledger queries, the advisory gate and the bodies of migration steps. The
//! production implementation is [`PgExecutor`]; [`crate::transaction::Transaction`]
//! implements it as well so step bodies run inside the step's transaction.

use may_postgres::types::ToSql;
use may_postgres::{Client, Error as PostgresError, Row};
use std::fmt;
use std::time::Instant;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Executor-level error type
#[derive(Debug)]
pub enum DbError {
    /// `PostgreSQL` error from `may_postgres`
    Postgres(PostgresError),
    /// Statement rejected or produced an unexpected result
    Query(String),
    /// Other execution errors
    Other(String),
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::Postgres(e) => write!(f, "PostgreSQL error: {e}"),
            DbError::Query(s) => write!(f, "Query error: {s}"),
            DbError::Other(s) => write!(f, "Execution error: {s}"),
        }
    }
}

impl std::error::Error for DbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DbError::Postgres(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PostgresError> for DbError {
    fn from(err: PostgresError) -> Self {
        DbError::Postgres(err)
    }
}

/// Trait for executing database statements
///
/// Migration code receives a `&dyn Executor` that is bound to the step's
/// transaction, so everything it runs commits or rolls back together with
/// the ledger update for that step.
///
/// # Examples
///
/// ```no_run
/// use tideline::executor::{DbError, Executor};
///
/// fn seed(executor: &dyn Executor) -> Result<(), DbError> {
///     executor.batch_execute("CREATE TABLE foo (id INT); INSERT INTO foo VALUES (1);")?;
///     let rows = executor.execute("UPDATE foo SET id = $1", &[&2i32])?;
///     assert_eq!(rows, 1);
///     Ok(())
/// }
/// ```
pub trait Executor {
    /// Execute a single parameterised statement and return the number of rows affected
    fn execute(&self, query: &str, params: &[&dyn ToSql]) -> Result<u64, DbError>;

    /// Execute one or more `;`-separated statements without parameters
    ///
    /// This is how declarative migration bodies are run: the body is sent as
    /// a single simple-protocol batch.
    fn batch_execute(&self, sql: &str) -> Result<(), DbError>;

    /// Execute a query and return all rows
    fn query_all(&self, query: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, DbError>;
}

/// [`Executor`] implementation over a `may_postgres::Client`
pub struct PgExecutor {
    client: Client,
}

impl PgExecutor {
    /// Create a new executor from a `may_postgres::Client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Get a reference to the underlying client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Start a new transaction on this executor's connection
    ///
    /// # Errors
    ///
    /// Returns `TransactionError` if `BEGIN` fails.
    pub fn begin(&self) -> Result<crate::transaction::Transaction, crate::transaction::TransactionError> {
        crate::transaction::Transaction::new(self.client.clone())
    }
}

impl Executor for PgExecutor {
    fn execute(&self, query: &str, params: &[&dyn ToSql]) -> Result<u64, DbError> {
        timed(query, || self.client.execute(query, params))
    }

    fn batch_execute(&self, sql: &str) -> Result<(), DbError> {
        timed(sql, || self.client.batch_execute(sql))
    }

    fn query_all(&self, query: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, DbError> {
        timed(query, || self.client.query(query, params))
    }
}

/// Run a driver call with a statement span and trace-level timing
pub(crate) fn timed<T>(
    statement: &str,
    call: impl FnOnce() -> Result<T, PostgresError>,
) -> Result<T, DbError> {
    #[cfg(feature = "tracing")]
    let _span = tracing_helpers::statement_span(statement).entered();

    let start = Instant::now();
    let result = call().map_err(DbError::Postgres);
    log::trace!(
        "statement finished in {:?}: {}",
        start.elapsed(),
        first_line(statement)
    );
    result
}

fn first_line(statement: &str) -> &str {
    statement.trim_start().lines().next().unwrap_or("")
}
