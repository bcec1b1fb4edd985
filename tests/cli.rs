use assert_cmd::prelude::*;
use predicates::str::contains;
use std::fs;
use std::process::Command;
use tempfile::TempDir;

#[test]
fn cli_version() {
    Command::cargo_bin("taskscope")
        .unwrap()
        .args(&["-V"])
        .assert()
        .stdout(contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn cli_no_args() {
    Command::cargo_bin("taskscope").unwrap().assert().failure();
}

#[test]
fn cli_fanout_completes() {
    Command::cargo_bin("taskscope")
        .unwrap()
        .args(&["fanout", "--workers", "2", "--tasks", "3", "--sleep-ms", "10"])
        .assert()
        .success()
        .stdout(contains("task 2: succeeded (2)"))
        .stdout(contains("completed 3/3"));
}

#[test]
fn cli_fanout_shutdown_on_failure() {
    Command::cargo_bin("taskscope")
        .unwrap()
        .args(&[
            "fanout",
            "--workers",
            "1",
            "--tasks",
            "4",
            "--sleep-ms",
            "50",
            "--fail-every",
            "1",
            "--mode",
            "shutdown-on-failure",
        ])
        .assert()
        .success()
        .stdout(contains("failed: "))
        .stdout(contains("task 0 failed"));
}

#[test]
fn cli_fanout_join_all_reports_failures() {
    Command::cargo_bin("taskscope")
        .unwrap()
        .args(&[
            "fanout",
            "--workers",
            "2",
            "--tasks",
            "4",
            "--sleep-ms",
            "1",
            "--fail-every",
            "2",
        ])
        .assert()
        .success()
        .stdout(contains("task 0: succeeded (0)"))
        .stdout(contains("task 1: failed"))
        .stdout(contains("completed 2/4"));
}

#[test]
fn cli_fanout_deadline() {
    Command::cargo_bin("taskscope")
        .unwrap()
        .args(&[
            "fanout",
            "--workers",
            "1",
            "--tasks",
            "2",
            "--sleep-ms",
            "2000",
            "--deadline-ms",
            "20",
        ])
        .assert()
        .success()
        .stdout(contains("timed out"));
}

#[test]
fn cli_requests() {
    Command::cargo_bin("taskscope")
        .unwrap()
        .args(&["requests", "--users", "2", "--flaky", "1"])
        .assert()
        .success()
        .stdout(contains("user0: John Doe, order_user0 99.99 (attempts 2/2)"))
        .stdout(contains("user1: John Doe, order_user1 99.99"));
}

#[test]
fn cli_invalid_config() {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let path = temp_dir.path().join("bad.json");
    fs::write(&path, r#"{ "retry": { "max_attempts": 0 } }"#).unwrap();

    Command::cargo_bin("taskscope")
        .unwrap()
        .args(&["fanout", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(contains("Invalid configuration"));
}

#[test]
fn cli_requests_respects_configured_attempts() {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let path = temp_dir.path().join("single.json");
    fs::write(&path, r#"{ "retry": { "max_attempts": 1 } }"#).unwrap();

    Command::cargo_bin("taskscope")
        .unwrap()
        .args(&["requests", "--users", "1", "--flaky", "1", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(contains("user0: error: "))
        .stdout(contains("attempt 1"));
}
