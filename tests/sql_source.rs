//! Loading declarative migrations from a directory

use std::fs;
use std::path::Path;
use tideline::migration::{MigrationError, MigrationSource, SqlDirectory, StepBody};

fn write(dir: &Path, name: &str, content: &str) {
    fs::write(dir.join(name), content).unwrap();
}

fn bodies(body: &StepBody) -> (&str, &str) {
    match body {
        StepBody::Sql { up, down } => (up.as_str(), down.as_str()),
        StepBody::Code(_) => panic!("expected a SQL step"),
    }
}

#[test]
fn test_loads_sorted_steps_and_skips_noise() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "2000_seed.sql",
        "-- +migrate Up\nINSERT INTO foo VALUES (1);\n-- +migrate Down\nDELETE FROM foo;\n",
    );
    write(
        dir.path(),
        "1000_init.SQL",
        "-- preamble is ignored\n--+migrate up\nCREATE TABLE foo (id INT);\n\n--  +MIGRATE   DOWN  \nDROP TABLE foo;\n",
    );
    write(dir.path(), "README.md", "# migrations");
    write(dir.path(), "notes.sql", "-- +migrate Up\nSELECT 1;\n");
    write(dir.path(), "v3_bad.sql", "-- +migrate Up\nSELECT 1;\n");
    fs::create_dir(dir.path().join("3000_archive.sql")).unwrap();

    let set = SqlDirectory::new(dir.path()).load().unwrap();

    let labels: Vec<String> = set.steps().iter().map(|s| s.label()).collect();
    assert_eq!(labels, vec!["1000_init", "2000_seed"]);

    let init = set.get(1000).unwrap();
    assert_eq!(
        bodies(&init.body),
        ("CREATE TABLE foo (id INT);", "DROP TABLE foo;")
    );
    assert_eq!(set.latest_version(), Some(2000));
}

#[test]
fn test_custom_extension() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "1000_init.sql", "-- +migrate Up\nSELECT 1;\n");
    write(dir.path(), "1000_init.pgsql", "-- +migrate Up\nSELECT 2;\n");

    let set = SqlDirectory::new(dir.path())
        .with_extension("pgsql")
        .load()
        .unwrap();

    assert_eq!(set.len(), 1);
    assert_eq!(bodies(&set.steps()[0].body).0, "SELECT 2;");
}

#[test]
fn test_missing_name_and_missing_markers() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "1000_.sql", "CREATE TABLE ignored (id INT);\n");

    let set = SqlDirectory::new(dir.path()).load().unwrap();
    let step = &set.steps()[0];
    assert_eq!(step.name, "migration");
    assert_eq!(bodies(&step.body), ("", ""));
}

#[test]
fn test_duplicate_versions_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "1000_init.sql", "-- +migrate Up\nSELECT 1;\n");
    write(dir.path(), "1000_other.sql", "-- +migrate Up\nSELECT 2;\n");

    let err = SqlDirectory::new(dir.path()).load().unwrap_err();
    assert!(matches!(err, MigrationError::DuplicateVersion { version: 1000, .. }));
}

#[test]
fn test_unreadable_file_names_the_file() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("1000_binary.sql"), [0xff, 0xfe, 0x00, 0x80]).unwrap();

    match SqlDirectory::new(dir.path()).load().unwrap_err() {
        MigrationError::Parse { file, .. } => assert!(file.ends_with("1000_binary.sql")),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_missing_directory() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope");

    match SqlDirectory::new(&missing).load().unwrap_err() {
        MigrationError::Parse { file, .. } => assert_eq!(file, missing),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_checksum_tracks_content() {
    let dir = tempfile::tempdir().unwrap();
    let content = "-- +migrate Up\nCREATE TABLE foo (id INT);\n-- +migrate Down\nDROP TABLE foo;\n";
    write(dir.path(), "1000_init.sql", content);

    let source = SqlDirectory::new(dir.path());
    let first = source.load().unwrap().steps()[0].checksum.clone();
    let again = source.load().unwrap().steps()[0].checksum.clone();
    assert_eq!(first, again);
    assert_eq!(first.len(), 64);

    write(dir.path(), "1000_init.sql", &content.replace("INT", "BIGINT"));
    let changed = source.load().unwrap().steps()[0].checksum.clone();
    assert_ne!(first, changed);
}
