//! Tests for the techsense command-line interface.

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;

/// Helper to create a config file holding `content`.
fn config_file(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("techsense").unwrap();
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("solar panel cleaning robot"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("check-config"))
        .stdout(predicate::str::contains("history"));
}

#[test]
fn test_no_subcommand_shows_error() {
    let mut cmd = Command::cargo_bin("techsense").unwrap();
    cmd.assert().failure().code(2);
}

#[test]
fn test_check_config_lists_defaults() {
    let file = config_file(
        r#"
        [device]
        timezone = "Europe/Berlin"
        "#,
    );

    let mut cmd = Command::cargo_bin("techsense").unwrap();
    cmd.arg("check-config").arg(file.path());

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK"))
        .stdout(predicate::str::contains("Europe/Berlin"))
        .stdout(predicate::str::contains("High Soiling Auto-Clean"))
        .stdout(predicate::str::contains("Morning Auto-Clean"))
        .stdout(predicate::str::contains("06:30 Mon,Wed,Fri -> full_sweep"));
}

#[test]
fn test_check_config_rejects_invalid() {
    let file = config_file(
        r#"
        [scheduler]
        tick_secs = 0
        "#,
    );

    let mut cmd = Command::cargo_bin("techsense").unwrap();
    cmd.arg("check-config").arg(file.path());

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("tick_secs"));
}

#[test]
fn test_history_requires_existing_db() {
    let dir = tempfile::tempdir().unwrap();

    let mut cmd = Command::cargo_bin("techsense").unwrap();
    cmd.arg("history")
        .arg("--db")
        .arg(dir.path().join("missing.redb"));

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn test_history_rejects_unknown_outcome() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("history.redb");
    std::fs::write(&db, b"").unwrap();

    let mut cmd = Command::cargo_bin("techsense").unwrap();
    cmd.arg("history")
        .arg("--db")
        .arg(&db)
        .arg("--outcome")
        .arg("maybe");

    cmd.assert().failure();
}
