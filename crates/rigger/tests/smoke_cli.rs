//! CLI smoke tests that don't require Docker or remote hosts.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Settings keeping every path inside `root`
fn write_settings(root: &Path, extra: &str) -> std::path::PathBuf {
    let path = root.join("rigger.toml");
    let content = format!(
        "workspace_root = \"{}\"\nartifact_dir = \"{}\"\njob_dir = \"{}\"\nevent_log = \"{}\"\n{}",
        root.join("work").display(),
        root.join("artifacts").display(),
        root.join("jobs").display(),
        root.join("events.jsonl").display(),
        extra
    );
    fs::write(&path, content).unwrap();
    path
}

fn rigger(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("rigger").unwrap();
    cmd.env_remove("RIGGER_CONFIG")
        .env_remove("RIGGER_WORKSPACE_ROOT")
        .env_remove("RIGGER_ARTIFACT_DIR")
        .env_remove("RIGGER_JOB_DIR")
        .arg("--config")
        .arg(config);
    cmd
}

#[test]
fn smoke_cli_help_lists_subcommands() {
    Command::cargo_bin("rigger")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("build"))
        .stdout(predicate::str::contains("deploy"))
        .stdout(predicate::str::contains("check-image"));
}

#[test]
fn smoke_cli_check_image_allowed() {
    let tmp = TempDir::new().unwrap();
    let config = write_settings(tmp.path(), "[docker.allowed_images]\nmyapp = [\"*\"]\n");
    rigger(&config)
        .arg("check-image")
        .arg("myapp")
        .assert()
        .success()
        .stdout(predicate::str::contains("myapp:latest"));
}

#[test]
fn smoke_cli_check_image_rejected() {
    let tmp = TempDir::new().unwrap();
    let config = write_settings(tmp.path(), "[docker.allowed_images]\nmyapp = [\"v1\"]\n");
    rigger(&config)
        .arg("check-image")
        .arg("myapp:v2")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Allowed images: myapp:v1"));
}

#[test]
fn smoke_cli_malformed_dns_entry_is_config_error() {
    let tmp = TempDir::new().unwrap();
    let config = write_settings(tmp.path(), "[docker]\ndns_hosts = [\"db.internal\"]\n");
    rigger(&config)
        .arg("check-image")
        .arg("debian")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("db.internal"));
}

#[test]
fn smoke_cli_build_unknown_job_exits_with_resolve_code() {
    let tmp = TempDir::new().unwrap();
    let config = write_settings(tmp.path(), "");
    rigger(&config)
        .arg("build")
        .arg("missing-job")
        .assert()
        .code(10)
        .stdout(predicate::str::contains("!!! Resolve failed"));

    let events = fs::read_to_string(tmp.path().join("events.jsonl")).unwrap();
    let failure = events
        .lines()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .any(|event| event.to_string().contains("missing-job"));
    assert!(failure, "event log should mention the job: {}", events);
}
