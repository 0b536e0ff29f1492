//! The `hostwatch` binary's one-shot subcommands.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use tempfile::NamedTempFile;

fn config_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn hostwatch() -> Command {
    let mut cmd = Command::cargo_bin("hostwatch").unwrap();
    cmd.env_remove("RUST_LOG");
    cmd
}

const ONLY_CPU_AND_MEMORY: &str = r#"
[providers.disk]
enabled = false
[providers.network]
enabled = false
[providers.process]
enabled = false
"#;

#[test]
fn test_check_config_accepts_valid_file() {
    let file = config_file(
        r#"
        [providers.cpu]
        interval_seconds = 1

        [[alerts.rules]]
        name = "cpu-high"
        metric = "cpu.average.cpu_percent"
        operator = "gt"
        threshold = 90.0

        [backend]
        url = "http://influx.internal:8086"
        "#,
    );

    hostwatch()
        .args(["--config", file.path().to_str().unwrap(), "check-config"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK"))
        .stdout(predicate::str::contains("alert rules: 1"))
        .stdout(predicate::str::contains("http://influx.internal:8086"));
}

#[test]
fn test_check_config_rejects_invalid_rule() {
    let file = config_file(
        r#"
        [[alerts.rules]]
        name = "mem"
        metric = "memory.virtual_memory.percent"
        operator = "gt"
        threshold = 90.0
        hysteresis = 0
        "#,
    );

    hostwatch()
        .args(["--config", file.path().to_str().unwrap(), "check-config"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("Configuration OK").not());
}

#[test]
fn test_missing_config_file_fails() {
    hostwatch()
        .args(["--config", "/nonexistent/hostwatch.toml", "check-config"])
        .assert()
        .failure();
}

#[test]
fn test_once_prints_csv_snapshot() {
    let file = config_file(ONLY_CPU_AND_MEMORY);

    let output = hostwatch()
        .args([
            "--config",
            file.path().to_str().unwrap(),
            "--no-backend",
            "once",
            "--format",
            "csv",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 2, "expected header and one row, got {:?}", lines);
    let header: Vec<&str> = lines[0].split(',').collect();
    let row: Vec<&str> = lines[1].split(',').collect();
    assert_eq!(header[0], "captured_at");
    assert_eq!(header.len(), row.len());
    assert!(header.contains(&"memory_virtual_memory_total"));
    assert!(header.iter().all(|key| *key == "captured_at"
        || key.starts_with("cpu_")
        || key.starts_with("memory_")));
}

#[test]
fn test_once_prints_json_snapshot() {
    let file = config_file(ONLY_CPU_AND_MEMORY);

    let output = hostwatch()
        .args(["--config", file.path().to_str().unwrap(), "--no-backend", "once"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let snapshot: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let total = &snapshot["domains"]["memory"]["tree"]["virtual_memory"]["total"];
    assert!(total.is_u64(), "memory total should stay an integer: {}", total);
    assert!(snapshot["domains"]["cpu"].is_object());
}

#[test]
fn test_resync_requires_backend() {
    hostwatch()
        .args(["--no-backend", "resync"])
        .assert()
        .failure();
}

const HISTORY: &str = concat!(
    r#"{"captured_at":"2024-05-01T12:00:00Z","domains":{"process":{"captured_at":"2024-05-01T12:00:00Z","tree":{"pid":42}}}}"#,
    "\n",
    r#"{"captured_at":"2024-05-01T12:00:05Z","domains":{"cpu":{"captured_at":"2024-05-01T12:00:05Z","tree":{"average":{"cpu_percent":7.5}}}}}"#,
    "\n",
);

#[test]
fn test_export_history_as_csv() {
    let history = config_file(HISTORY);

    let output = hostwatch()
        .args([
            "export",
            "--format",
            "csv",
            "--input",
            history.path().to_str().unwrap(),
        ])
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(
        lines,
        vec![
            "captured_at,cpu_average_cpu_percent,process_pid",
            "2024-05-01T12:00:00+00:00,,42",
            "2024-05-01T12:00:05+00:00,7.5,",
        ]
    );
}

#[test]
fn test_export_history_as_json_file() {
    let history = config_file(HISTORY);
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("exports").join("history.json");

    hostwatch()
        .args([
            "export",
            "--input",
            history.path().to_str().unwrap(),
            "--output",
            target.to_str().unwrap(),
        ])
        .assert()
        .success();

    let exported: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&target).unwrap()).unwrap();
    let snapshots = exported.as_array().unwrap();
    assert_eq!(snapshots.len(), 2);
    assert!(snapshots[0]["domains"]["process"]["tree"]["pid"].is_i64());
}

#[test]
fn test_export_without_history_fails() {
    hostwatch()
        .args(["export", "--input", "/nonexistent/history.jsonl"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No snapshots to export"));
}
