//! Migration file discovery and parsing
//!
//! A migration file is named `<version>_<name>.<ext>` and carries its two
//! bodies between marker lines:
//!
//! ```sql
//! -- +migrate Up
//! CREATE TABLE foo (id INT);
//!
//! -- +migrate Down
//! DROP TABLE foo;
//! ```
//!
//! Text before the first marker is ignored. Markers are case-insensitive and
//! tolerate surrounding whitespace, so `--+migrate up` works too.

use crate::migration::step::{MigrationSet, MigrationSource, Step};
use crate::migration::MigrationError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

/// Default migration file extension
pub const DEFAULT_EXTENSION: &str = "sql";

static MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*--\s*\+migrate\s+(up|down)\s*$")
        .unwrap_or_else(|e| panic!("invalid marker pattern: {e}"))
});

/// A directory of declarative migration files
#[derive(Debug, Clone)]
pub struct SqlDirectory {
    dir: PathBuf,
    extension: String,
}

impl SqlDirectory {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            extension: DEFAULT_EXTENSION.to_string(),
        }
    }

    /// Only consider files with this extension (compared case-insensitively)
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into().trim_start_matches('.').to_string();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Parse every matching file in the directory
    ///
    /// Entries that are directories, have another extension, or do not
    /// start with `<version>_` are skipped. The result is in directory
    /// order; [`MigrationSource::load`] sorts it.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Parse` naming the directory if it cannot be
    /// listed, or naming the file if a matching file cannot be read.
    pub fn discover(&self) -> Result<Vec<Step>, MigrationError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| MigrationError::Parse {
            file: self.dir.clone(),
            reason: format!("failed to read migrations directory: {e}"),
        })?;

        let mut steps = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| MigrationError::Parse {
                file: self.dir.clone(),
                reason: format!("failed to read directory entry: {e}"),
            })?;
            let path = entry.path();
            if path.is_dir() {
                continue;
            }

            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                log::debug!("skipping {}: file name is not valid UTF-8", path.display());
                continue;
            };
            let Some((version, name)) = parse_filename(file_name, &self.extension) else {
                log::debug!("skipping {file_name}: not a <version>_<name>.{} file", self.extension);
                continue;
            };

            let content = fs::read_to_string(&path).map_err(|e| MigrationError::Parse {
                file: path.clone(),
                reason: e.to_string(),
            })?;
            let (up, down) = split_up_down(&content);
            steps.push(Step::sql(version, name, up, down));
        }

        Ok(steps)
    }
}

impl MigrationSource for SqlDirectory {
    fn load(&self) -> Result<MigrationSet, MigrationError> {
        let set = MigrationSet::new(self.discover()?)?;
        log::debug!("found {} migration file(s) in {}", set.len(), self.dir.display());
        Ok(set)
    }
}

/// Extract `(version, name)` from `<version>_<name>.<extension>`
///
/// The version is the run of digits before the first `_`. A missing name
/// (`1000_.sql`) becomes `migration`.
pub fn parse_filename(file_name: &str, extension: &str) -> Option<(i64, String)> {
    let (stem, ext) = file_name.rsplit_once('.')?;
    if !ext.eq_ignore_ascii_case(extension) {
        return None;
    }
    let (version, name) = stem.split_once('_')?;
    if version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let version = version.parse::<i64>().ok()?;
    let name = if name.is_empty() { "migration" } else { name };
    Some((version, name.to_string()))
}

/// Split file content into trimmed `(up, down)` bodies
///
/// Lines before the first marker are dropped. A region may be opened more
/// than once; its lines accumulate. Content without markers yields two
/// empty bodies.
pub fn split_up_down(content: &str) -> (String, String) {
    enum Region {
        Preamble,
        Up,
        Down,
    }

    let mut region = Region::Preamble;
    let mut up = String::new();
    let mut down = String::new();

    for line in content.lines() {
        if let Some(caps) = MARKER.captures(line) {
            region = if caps[1].eq_ignore_ascii_case("up") {
                Region::Up
            } else {
                Region::Down
            };
            continue;
        }
        let target = match region {
            Region::Preamble => continue,
            Region::Up => &mut up,
            Region::Down => &mut down,
        };
        target.push_str(line);
        target.push('\n');
    }

    (up.trim().to_string(), down.trim().to_string())
}
