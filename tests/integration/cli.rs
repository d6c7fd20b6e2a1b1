//! Tests for the `testrelay` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

/// Get a Command for the testrelay binary, isolated from ambient CI settings.
#[allow(deprecated)]
fn testrelay_cmd(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("testrelay").expect("Failed to find testrelay binary");
    cmd.current_dir(dir.path())
        .env_remove("GITHUB_TOKEN")
        .env("TESTRELAY__TIMEOUTS__SIMULATION_DELAY_MS", "10")
        .timeout(Duration::from_secs(20));
    cmd
}

#[test]
fn test_simulated_run_prints_json_summary() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    testrelay_cmd(&temp_dir)
        .args([
            "run",
            "--subject",
            "REQ-1",
            "--test-case",
            "TC_001",
            "--test-case",
            "TC_002",
            "--test-case",
            "TC_001",
            "--mode",
            "simulated",
            "--json",
        ])
        .assert()
        .code(predicate::in_iter([0, 1]))
        .stdout(predicate::str::contains("\"total_tests\": 2"))
        .stdout(predicate::str::contains("\"subject_id\": \"REQ-1\""));
}

#[test]
fn test_simulated_run_writes_journal() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    testrelay_cmd(&temp_dir)
        .args(["run", "--test-case", "TC_001", "--journal", "."])
        .assert()
        .stdout(predicate::str::contains("Started"));

    let executions = temp_dir.path().join(".testrelay").join("executions");
    let entries: Vec<_> = fs::read_dir(&executions)
        .expect("journal directory missing")
        .collect();
    assert_eq!(entries.len(), 1);
    let request_dir = entries[0].as_ref().unwrap().path();
    let events = fs::read_to_string(request_dir.join("events.jsonl")).unwrap();
    assert!(events.contains("\"event_type\":\"request_start\""));
    assert!(events.contains("\"event_type\":\"request_complete\""));
}

#[test]
fn test_ci_mode_without_repository_is_configuration_error() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    testrelay_cmd(&temp_dir)
        .args(["run", "--test-case", "TC_001", "--mode", "ci"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("no CI repository configured"));
}

#[test]
fn test_repository_without_token_is_configuration_error() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    fs::write(
        temp_dir.path().join("testrelay.toml"),
        "[ci]\nrepository = \"acme/app\"\n",
    )
    .unwrap();

    testrelay_cmd(&temp_dir)
        .args(["run", "--test-case", "TC_001"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("no CI token configured"));
}

#[test]
fn test_config_show_hides_secrets() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = temp_dir.path().join("custom.toml");
    fs::write(
        &config,
        "[ci]\nrepository = \"acme/app\"\ntoken = \"ghp_secret\"\n\n[relay]\nwebhook_secret = \"hush\"\n",
    )
    .unwrap();

    testrelay_cmd(&temp_dir)
        .arg("--config")
        .arg(&config)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("repository = \"acme/app\""))
        .stdout(predicate::str::contains("simulation_delay_ms = 10"))
        .stdout(predicate::str::contains("ghp_secret").not())
        .stdout(predicate::str::contains("hush").not());
}

#[test]
fn test_missing_config_file_is_configuration_error() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    testrelay_cmd(&temp_dir)
        .args(["--config", "missing.toml", "config", "show"])
        .assert()
        .code(2);
}
