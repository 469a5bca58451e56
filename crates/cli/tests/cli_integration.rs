//! CLI integration tests for the client subcommands.
//!
//! Uses `assert_cmd` to spawn the `fabric` binary with no peers configured
//! and an isolated data directory.

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// `fabric` with a clean environment and a throwaway data directory.
fn fabric(data_dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("fabric");
    cmd.env_remove("FABRIC_PEERS")
        .env_remove("FABRIC_SCENARIO")
        .env_remove("RUST_LOG")
        .arg("--data-dir")
        .arg(data_dir.path());
    cmd
}

#[test]
fn help_lists_subcommands() {
    let dir = TempDir::new().unwrap();
    fabric(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("tools"));
}

#[test]
fn version_flag_prints_version() {
    let dir = TempDir::new().unwrap();
    fabric(&dir)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn tools_without_peers_prints_empty_list() {
    let dir = TempDir::new().unwrap();
    let output = fabric(&dir).arg("tools").assert().success();
    let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(parsed, serde_json::json!([]));
}

#[test]
fn status_without_peers_prints_empty_list() {
    let dir = TempDir::new().unwrap();
    fabric(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"));
}

#[test]
fn config_file_with_unknown_key_fails() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("fabric.toml");
    fs::write(&config, "prot = 9000\n").unwrap();
    fabric(&dir)
        .arg("--config")
        .arg(&config)
        .arg("tools")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid config file"));
}

#[test]
fn missing_config_file_fails() {
    let dir = TempDir::new().unwrap();
    fabric(&dir)
        .arg("--config")
        .arg(dir.path().join("absent.toml"))
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot read config file"));
}

#[test]
fn unreachable_peer_is_reported_not_fatal() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("fabric.toml");
    // Port 9 (discard) on localhost is closed in test environments.
    fs::write(
        &config,
        "peers = [\"ghost\"]\n\n[timeouts]\nmanifest_fetch_secs = 2\n\n[scenarios.ghost]\nurl = \"http://127.0.0.1:9\"\n",
    )
    .unwrap();
    fabric(&dir)
        .arg("--config")
        .arg(&config)
        .arg("tools")
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"))
        .stderr(predicate::str::contains("ghost"));
}
