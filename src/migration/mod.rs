//! Versioned schema migrations
//!
//! Migrations come from a directory of marker-delimited SQL files
//! ([`SqlDirectory`]) or from Rust code registered in a [`Registry`]. Either
//! source produces a [`MigrationSet`]; the [`Migrator`] applies it against a
//! [`Backend`] under a cross-process lock, one transaction per step, and
//! records every outcome in the status ledger.
//!
//! # Example
//!
//! ```rust,no_run
//! use tideline::executor::{DbError, Executor};
//! use tideline::migration::{Migration, MigrationSource, Migrator, PgBackend, Registry};
//!
//! pub struct CreateUsersTable;
//!
//! impl Migration for CreateUsersTable {
//!     fn version(&self) -> i64 {
//!         20240120120000
//!     }
//!
//!     fn name(&self) -> &str {
//!         "create_users_table"
//!     }
//!
//!     fn up(&self, executor: &dyn Executor) -> Result<(), DbError> {
//!         executor.batch_execute("CREATE TABLE users (id BIGSERIAL PRIMARY KEY, email TEXT NOT NULL UNIQUE)")
//!     }
//!
//!     fn down(&self, executor: &dyn Executor) -> Result<(), DbError> {
//!         executor.batch_execute("DROP TABLE users")
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut registry = Registry::new();
//! registry.register(Box::new(CreateUsersTable))?;
//!
//! let settings = tideline::config::Settings::load(None)?.validate()?;
//! let migrator = Migrator::new(PgBackend::connect(&settings)?);
//! migrator.up(&registry.load()?)?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cancel;
pub mod checksum;
pub mod error;
pub mod file;
pub mod ledger;
pub mod lock;
pub mod migration;
pub mod migrator;
pub mod postgres;
pub mod record;
pub mod registry;
pub mod status;
pub mod step;

pub use backend::{Backend, Resolution, StepTransaction};
pub use cancel::CancelToken;
pub use error::{ErrorCategory, MigrationError};
pub use file::SqlDirectory;
pub use ledger::LedgerTable;
pub use lock::{with_lock, AdvisoryLock, LockGuard, PgAdvisoryLock};
pub use migration::Migration;
pub use migrator::{Migrator, NO_VERSION};
pub use postgres::PgBackend;
pub use record::{MigrationState, StatusRecord};
pub use registry::Registry;
pub use status::{MigrationStatus, VersionState, VersionStatus};
pub use step::{Direction, MigrationSet, MigrationSource, Step, StepBody};
