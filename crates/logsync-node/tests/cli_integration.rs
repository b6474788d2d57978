//! CLI integration tests
//!
//! The binary runs until Ctrl+C, so these only cover argument and config
//! handling, which fails before the node starts.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn cli_cmd(data_dir: &TempDir) -> Command {
    let mut cmd =
        Command::cargo_bin("logsync-node").expect("Failed to find logsync-node binary");
    cmd.arg("--data-dir").arg(data_dir.path());
    cmd
}

#[test]
fn test_help_lists_flags() {
    Command::cargo_bin("logsync-node")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--listen"))
        .stdout(predicate::str::contains("--room"))
        .stdout(predicate::str::contains("--legacy-wire"));
}

#[test]
fn test_invalid_config_file_fails() {
    let data_dir = TempDir::new().unwrap();
    let config = data_dir.path().join("config.json");
    std::fs::write(&config, r#"{ "queue": { "drain_interval_ms": 0 } }"#).unwrap();

    cli_cmd(&data_dir)
        .arg("--config")
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}

#[test]
fn test_missing_config_file_fails() {
    let data_dir = TempDir::new().unwrap();
    cli_cmd(&data_dir)
        .arg("--config")
        .arg(data_dir.path().join("nope.json"))
        .assert()
        .failure();
}

#[test]
fn test_bad_bootstrap_id_fails() {
    let data_dir = TempDir::new().unwrap();
    cli_cmd(&data_dir)
        .args(["--room", "garden", "--bootstrap", "not-an-endpoint"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid configuration"));
}

#[test]
fn test_bad_follow_peer_fails() {
    let data_dir = TempDir::new().unwrap();
    cli_cmd(&data_dir)
        .args(["--follow", "not-a-peer"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid peer id"));
}
