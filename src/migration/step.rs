//! Steps: the unit the engine applies and rolls back

use crate::executor::{DbError, Executor};
use crate::migration::checksum::{code_checksum, sql_checksum};
use crate::migration::{Migration, MigrationError};
use std::fmt;
use std::sync::Arc;

/// Direction a step is run in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Executable content of a step
#[derive(Clone)]
pub enum StepBody {
    /// Statement text read from a migration file
    Sql { up: String, down: String },
    /// Registered Rust code
    Code(Arc<dyn Migration>),
}

/// An immutable migration definition
#[derive(Clone)]
pub struct Step {
    pub version: i64,
    pub name: String,
    pub checksum: String,
    pub body: StepBody,
}

impl Step {
    /// Declarative step; the checksum is derived from both bodies
    pub fn sql(version: i64, name: impl Into<String>, up: impl Into<String>, down: impl Into<String>) -> Self {
        let up = up.into();
        let down = down.into();
        Self {
            version,
            name: name.into(),
            checksum: sql_checksum(&up, &down),
            body: StepBody::Sql { up, down },
        }
    }

    /// Procedural step backed by a registered migration
    pub fn code(migration: Arc<dyn Migration>) -> Self {
        let version = migration.version();
        let name = migration.name().to_string();
        Self {
            version,
            checksum: code_checksum(version, &name),
            name,
            body: StepBody::Code(migration),
        }
    }

    /// `<version>_<name>`, the label used in logs and errors
    pub fn label(&self) -> String {
        format!("{}_{}", self.version, self.name)
    }

    /// Run the step's content in `direction` against `executor`
    ///
    /// An empty declarative body is a successful no-op.
    pub fn run(&self, direction: Direction, executor: &dyn Executor) -> Result<(), DbError> {
        match &self.body {
            StepBody::Sql { up, down } => {
                let sql = match direction {
                    Direction::Up => up,
                    Direction::Down => down,
                };
                if sql.trim().is_empty() {
                    log::debug!("{} has no {direction} statements, nothing to run", self.label());
                    return Ok(());
                }
                executor.batch_execute(sql)
            }
            StepBody::Code(migration) => match direction {
                Direction::Up => migration.up(executor),
                Direction::Down => migration.down(executor),
            },
        }
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.body {
            StepBody::Sql { .. } => "sql",
            StepBody::Code(_) => "code",
        };
        f.debug_struct("Step")
            .field("version", &self.version)
            .field("name", &self.name)
            .field("checksum", &self.checksum)
            .field("kind", &kind)
            .finish()
    }
}

/// Steps ordered by ascending version, with unique versions
#[derive(Debug, Clone, Default)]
pub struct MigrationSet {
    steps: Vec<Step>,
}

impl MigrationSet {
    /// Sort `steps` by version
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::DuplicateVersion` if two steps share a version.
    pub fn new(mut steps: Vec<Step>) -> Result<Self, MigrationError> {
        steps.sort_by_key(|s| s.version);
        if let Some(pair) = steps.windows(2).find(|w| w[0].version == w[1].version) {
            return Err(MigrationError::DuplicateVersion {
                version: pair[1].version,
                name: pair[1].name.clone(),
            });
        }
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Look a step up by version
    pub fn get(&self, version: i64) -> Option<&Step> {
        self.steps
            .binary_search_by_key(&version, |s| s.version)
            .ok()
            .map(|i| &self.steps[i])
    }

    pub fn latest_version(&self) -> Option<i64> {
        self.steps.last().map(|s| s.version)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Anything that can produce the set of steps to run
pub trait MigrationSource {
    /// Load and order the steps
    fn load(&self) -> Result<MigrationSet, MigrationError>;
}

impl MigrationSource for MigrationSet {
    fn load(&self) -> Result<MigrationSet, MigrationError> {
        Ok(self.clone())
    }
}
