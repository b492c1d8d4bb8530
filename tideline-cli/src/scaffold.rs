//! `tideline create`: new migration files

use chrono::Utc;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tideline::config::SourceKind;

#[derive(Debug, Error)]
pub enum ScaffoldError {
    #[error("failed to create migrations directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("migration file {0} already exists")]
    Exists(PathBuf),

    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// A freshly written migration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedMigration {
    pub version: i64,
    pub name: String,
    pub path: PathBuf,
}

/// Version for a new migration: the current time in Unix milliseconds
pub fn next_version() -> i64 {
    Utc::now().timestamp_millis()
}

/// Reduce a free-form name to `[A-Za-z0-9_-]`
///
/// Spaces, dots and path separators become `_`, anything else is dropped.
/// An empty result becomes `migration`.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .filter_map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '-' => Some(c),
            ' ' | '.' | '/' | '\\' => Some('_'),
            _ => None,
        })
        .collect();

    if cleaned.is_empty() {
        "migration".to_string()
    } else {
        cleaned
    }
}

/// Write an empty migration named `name` into `dir`
///
/// SQL sources get `<version>_<name>.sql` with both markers; code sources get
/// `m<version>_<name>.rs` holding a `Migration` skeleton to register.
pub fn create_migration(
    dir: &Path,
    name: &str,
    kind: SourceKind,
    version: i64,
) -> Result<CreatedMigration, ScaffoldError> {
    let name = sanitize_name(name);
    fs::create_dir_all(dir).map_err(|source| ScaffoldError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let (file_name, content) = match kind {
        SourceKind::Sql => (format!("{version}_{name}.sql"), sql_template()),
        SourceKind::Code => (
            format!("m{version}_{}.rs", name.replace('-', "_")),
            code_template(version, &name),
        ),
    };

    let path = dir.join(file_name);
    if path.exists() {
        return Err(ScaffoldError::Exists(path));
    }
    fs::write(&path, content).map_err(|source| ScaffoldError::Write {
        path: path.clone(),
        source,
    })?;
    log::debug!("wrote {}", path.display());

    Ok(CreatedMigration { version, name, path })
}

fn sql_template() -> String {
    "-- +migrate Up\n\n\n-- +migrate Down\n".to_string()
}

fn code_template(version: i64, name: &str) -> String {
    let type_name = type_name(name);
    format!(
        r#"use tideline::executor::{{DbError, Executor}};
use tideline::migration::Migration;

pub struct {type_name};

impl Migration for {type_name} {{
    fn version(&self) -> i64 {{
        {version}
    }}

    fn name(&self) -> &str {{
        "{name}"
    }}

    fn up(&self, executor: &dyn Executor) -> Result<(), DbError> {{
        executor.batch_execute("")
    }}

    fn down(&self, executor: &dyn Executor) -> Result<(), DbError> {{
        executor.batch_execute("")
    }}
}}
"#
    )
}

/// `create_users-table` -> `CreateUsersTable`
fn type_name(name: &str) -> String {
    let camel: String = name
        .split(['_', '-'])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect();

    if camel.starts_with(|c: char| c.is_ascii_digit()) || camel.is_empty() {
        format!("Migration{camel}")
    } else {
        camel
    }
}
