//! Command handlers
//!
//! Each handler drives a [`Migrator`] over any [`Backend`] and writes its
//! human-readable report to `out`.

use crate::scaffold::{self, CreatedMigration};
use anyhow::Result;
use colored::Colorize;
use std::io::Write;
use std::path::Path;
use tideline::config::Settings;
use tideline::migration::{
    Backend, MigrationSet, MigrationStatus, Migrator, Resolution, VersionState, NO_VERSION,
};

pub fn up<B: Backend>(out: &mut dyn Write, migrator: &Migrator<B>, set: &MigrationSet) -> Result<usize> {
    writeln!(out, "Applying migrations...")?;
    let applied = migrator.up(set)?;
    if applied > 0 {
        writeln!(out, "✅ Successfully applied {applied} migration(s)")?;
    } else {
        writeln!(out, "✅ No migrations to apply")?;
    }
    Ok(applied)
}

pub fn down<B: Backend>(
    out: &mut dyn Write,
    migrator: &Migrator<B>,
    set: &MigrationSet,
) -> Result<Option<i64>> {
    writeln!(out, "Rolling back the latest migration...")?;
    let reverted = migrator.down(set)?;
    match reverted {
        Some(version) => writeln!(out, "✅ Rolled back {}", label(set, version))?,
        None => writeln!(out, "✅ No applied migrations to roll back")?,
    }
    Ok(reverted)
}

pub fn redo<B: Backend>(
    out: &mut dyn Write,
    migrator: &Migrator<B>,
    set: &MigrationSet,
) -> Result<Option<i64>> {
    writeln!(out, "Redoing the latest migration...")?;
    let reverted = migrator.redo(set)?;
    match reverted {
        Some(version) => writeln!(out, "✅ Rolled back and re-applied {}", label(set, version))?,
        None => writeln!(out, "✅ Nothing was applied; ran pending migrations")?,
    }
    Ok(reverted)
}

pub fn status<B: Backend>(
    out: &mut dyn Write,
    migrator: &Migrator<B>,
    set: &MigrationSet,
    json: bool,
) -> Result<MigrationStatus> {
    let report = migrator.report(set)?;
    if json {
        serde_json::to_writer_pretty(&mut *out, &report)?;
        writeln!(out)?;
    } else {
        print_report(out, &report)?;
    }
    Ok(report)
}

fn print_report(out: &mut dyn Write, report: &MigrationStatus) -> Result<()> {
    writeln!(out, "\n📊 Migration Status\n")?;

    if report.versions.is_empty() {
        writeln!(out, "No migrations found")?;
    }
    for entry in &report.versions {
        let line = format!("{}_{}", entry.version, entry.name);
        match entry.state {
            VersionState::Applied => {
                let applied_at = entry
                    .applied_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                    .unwrap_or_default();
                let ms = entry.execution_ms.unwrap_or_default();
                write!(out, "  {} {} ({applied_at}, {ms}ms)", "✓".green(), line)?;
                if entry.drifted {
                    write!(out, " {}", "checksum changed".yellow())?;
                }
                writeln!(out)?;
            }
            VersionState::Pending => writeln!(out, "  ⏳ {line} {}", "(pending)".dimmed())?,
            VersionState::Failed => {
                writeln!(out, "  {} {line} {}", "✗".red(), "(failed)".red())?;
                if let Some(error) = &entry.error_text {
                    writeln!(out, "      {error}")?;
                }
            }
            VersionState::Orphaned => {
                let stored = entry
                    .ledger_status
                    .map_or("unknown", |status| status.as_str());
                writeln!(out, "  ? {line} {}", format!("({stored}, not in source)").yellow())?;
                if let Some(error) = &entry.error_text {
                    writeln!(out, "      {error}")?;
                }
            }
        }
    }

    writeln!(
        out,
        "\n📈 Summary: {} applied, {} pending, {} failed, {} orphaned",
        report.applied_count(),
        report.pending_count(),
        report.failed_count(),
        report.orphaned_count()
    )?;
    if let Some(next) = report.next_pending_version() {
        writeln!(out, "Next pending version: {next}")?;
    }
    Ok(())
}

pub fn version<B: Backend>(out: &mut dyn Write, migrator: &Migrator<B>) -> Result<i64> {
    let current = migrator.current_version()?;
    if current == NO_VERSION {
        writeln!(out, "{current} (no migrations applied)")?;
    } else {
        writeln!(out, "{current}")?;
    }
    Ok(current)
}

pub fn validate<B: Backend>(
    out: &mut dyn Write,
    migrator: &Migrator<B>,
    set: &MigrationSet,
) -> Result<usize> {
    writeln!(out, "Validating checksums...")?;
    let checked = migrator.validate(set)?;
    writeln!(out, "✅ All {checked} applied checksum(s) valid")?;
    Ok(checked)
}

pub fn resolve<B: Backend>(
    out: &mut dyn Write,
    migrator: &Migrator<B>,
    version: i64,
    resolution: Resolution,
) -> Result<()> {
    migrator.resolve(version, resolution)?;
    let outcome = match resolution {
        Resolution::Applied => "marked applied",
        Resolution::Pending => "reset to pending",
    };
    writeln!(out, "✅ Migration {version} {outcome}")?;
    Ok(())
}

pub fn create(out: &mut dyn Write, settings: &Settings, name: &str) -> Result<CreatedMigration> {
    let created = scaffold::create_migration(
        &settings.path,
        name,
        settings.kind,
        scaffold::next_version(),
    )?;
    writeln!(out, "✅ Generated migration: {}", display_path(&created.path))?;
    match settings.kind {
        tideline::config::SourceKind::Sql => {
            writeln!(out, "   Fill in the -- +migrate Up and -- +migrate Down sections")?
        }
        tideline::config::SourceKind::Code => {
            writeln!(out, "   Implement up() and down(), then register it on your Registry")?
        }
    }
    Ok(created)
}

/// `path` relative to the working directory when possible
fn display_path(path: &Path) -> String {
    std::env::current_dir()
        .ok()
        .and_then(|cwd| pathdiff::diff_paths(path, cwd))
        .filter(|relative| !relative.as_os_str().is_empty())
        .unwrap_or_else(|| path.to_path_buf())
        .display()
        .to_string()
}

fn label(set: &MigrationSet, version: i64) -> String {
    set.get(version)
        .map_or_else(|| version.to_string(), |step| step.label())
}
