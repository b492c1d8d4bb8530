//! # Tideline
//!
//! Versioned PostgreSQL schema migrations on the `may` coroutine runtime.
//!
//! Steps are applied in ascending version order, each in its own
//! transaction together with its status ledger row, while a session-level
//! advisory lock keeps concurrent runners apart. See [`migration`] for the
//! engine and [`config`] for how settings are loaded.

pub mod config;
pub mod connection;
pub mod executor;
#[cfg(any(feature = "metrics", feature = "tracing"))]
pub mod metrics;
pub mod migration;
pub mod transaction;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use config::Settings;
pub use executor::{DbError, Executor, PgExecutor};
pub use migration::{MigrationError, Migrator};
