//! Registry of migrations written in Rust
//!
//! The registry is an ordinary value built at startup and handed to the
//! engine. It is filled with `&mut self` calls, so all registration is done
//! before it can be shared for a run.

use crate::executor::{DbError, Executor};
use crate::migration::step::{MigrationSet, MigrationSource, Step};
use crate::migration::{Migration, MigrationError};
use std::collections::HashMap;
use std::sync::Arc;

type StepFn = dyn Fn(&dyn Executor) -> Result<(), DbError> + Send + Sync;

/// Process-local table of code migrations, keyed by version
#[derive(Default, Clone)]
pub struct Registry {
    by_version: HashMap<i64, Arc<dyn Migration>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a migration
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::DuplicateVersion` if the version is taken.
    pub fn register(&mut self, migration: Box<dyn Migration>) -> Result<(), MigrationError> {
        let version = migration.version();
        if self.by_version.contains_key(&version) {
            return Err(MigrationError::DuplicateVersion {
                version,
                name: migration.name().to_string(),
            });
        }
        log::debug!("registered code migration {version}_{}", migration.name());
        self.by_version.insert(version, Arc::from(migration));
        Ok(())
    }

    /// Add a migration from a pair of closures
    ///
    /// ```
    /// use tideline::migration::Registry;
    ///
    /// let mut registry = Registry::new();
    /// registry
    ///     .register_fn(
    ///         3000,
    ///         "backfill",
    ///         |tx| tx.batch_execute("UPDATE users SET active = true"),
    ///         |_| Ok(()),
    ///     )
    ///     .unwrap();
    /// assert!(registry.contains(3000));
    /// ```
    pub fn register_fn<U, D>(
        &mut self,
        version: i64,
        name: impl Into<String>,
        up: U,
        down: D,
    ) -> Result<(), MigrationError>
    where
        U: Fn(&dyn Executor) -> Result<(), DbError> + Send + Sync + 'static,
        D: Fn(&dyn Executor) -> Result<(), DbError> + Send + Sync + 'static,
    {
        self.register(Box::new(FnMigration {
            version,
            name: name.into(),
            up: Box::new(up),
            down: Box::new(down),
        }))
    }

    pub fn contains(&self, version: i64) -> bool {
        self.by_version.contains_key(&version)
    }

    pub fn len(&self) -> usize {
        self.by_version.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_version.is_empty()
    }

    /// All registered migrations as steps, in no particular order
    pub fn steps(&self) -> Vec<Step> {
        self.by_version.values().cloned().map(Step::code).collect()
    }
}

impl MigrationSource for Registry {
    fn load(&self) -> Result<MigrationSet, MigrationError> {
        MigrationSet::new(self.steps())
    }
}

struct FnMigration {
    version: i64,
    name: String,
    up: Box<StepFn>,
    down: Box<StepFn>,
}

impl Migration for FnMigration {
    fn version(&self) -> i64 {
        self.version
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn up(&self, executor: &dyn Executor) -> Result<(), DbError> {
        (self.up)(executor)
    }

    fn down(&self, executor: &dyn Executor) -> Result<(), DbError> {
        (self.down)(executor)
    }
}
