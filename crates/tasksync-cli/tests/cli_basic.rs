//! Basic CLI E2E tests.
//!
//! Each test runs the built binary against its own temporary data directory.

use std::path::Path;
use std::process::Command;

/// Run a CLI command and return (stdout, stderr, exit code).
fn run_cli(data_dir: &Path, args: &[&str]) -> (String, String, i32) {
    let output = Command::new(env!("CARGO_BIN_EXE_tasksync-cli"))
        .args(args)
        .env("TASKSYNC_DATA_DIR", data_dir)
        .env_remove("TASKSYNC_SYNC_DISABLED")
        .env_remove("TASKSYNC_PEER_HOST")
        .env_remove("TASKSYNC_PEER_PORT")
        .env("RUST_LOG", "warn")
        .output()
        .expect("Failed to execute CLI command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let code = output.status.code().unwrap_or(-1);

    (stdout, stderr, code)
}

/// Create a task and return its id from the "Task created:" line.
fn add_task(data_dir: &Path, title: &str) -> String {
    let (stdout, stderr, code) = run_cli(data_dir, &["task", "add", title]);
    assert_eq!(code, 0, "task add failed: {stderr}");
    stdout
        .lines()
        .find_map(|line| line.strip_prefix("Task created: "))
        .expect("missing 'Task created:' line")
        .trim()
        .to_string()
}

fn list_json(data_dir: &Path) -> Vec<serde_json::Value> {
    let (stdout, stderr, code) = run_cli(data_dir, &["task", "list", "--json"]);
    assert_eq!(code, 0, "task list failed: {stderr}");
    serde_json::from_str::<Vec<serde_json::Value>>(&stdout).expect("list output is a JSON array")
}

#[test]
fn test_task_add_and_list() {
    let dir = tempfile::tempdir().unwrap();
    let id = add_task(dir.path(), "Write report");

    let tasks = list_json(dir.path());
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0]["id"], id.as_str());
    assert_eq!(tasks[0]["title"], "Write report");
    assert_eq!(tasks[0]["state"], "READY");
    assert_eq!(tasks[0]["eventVersion"], 1);
}

#[test]
fn test_task_list_empty() {
    let dir = tempfile::tempdir().unwrap();
    let (stdout, _, code) = run_cli(dir.path(), &["task", "list"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("No tasks."));
}

#[test]
fn test_task_done_bumps_version() {
    let dir = tempfile::tempdir().unwrap();
    let id = add_task(dir.path(), "Finish me");

    let (stdout, stderr, code) = run_cli(dir.path(), &["task", "done", &id]);
    assert_eq!(code, 0, "task done failed: {stderr}");
    assert!(stdout.contains("Task done:"));

    let tasks = list_json(dir.path());
    assert_eq!(tasks[0]["state"], "DONE");
    assert_eq!(tasks[0]["eventVersion"], 2);
    assert!(tasks[0]["completedAt"].is_string());
}

#[test]
fn test_task_snooze_and_resume() {
    let dir = tempfile::tempdir().unwrap();
    let id = add_task(dir.path(), "Later");

    let (_, stderr, code) = run_cli(dir.path(), &["task", "snooze", &id, "--minutes", "15"]);
    assert_eq!(code, 0, "task snooze failed: {stderr}");
    assert_eq!(list_json(dir.path())[0]["state"], "SNOOZED");

    let (_, stderr, code) = run_cli(dir.path(), &["task", "resume", &id]);
    assert_eq!(code, 0, "task resume failed: {stderr}");
    assert_eq!(list_json(dir.path())[0]["state"], "READY");
}

#[test]
fn test_task_done_unknown_id_fails() {
    let dir = tempfile::tempdir().unwrap();
    let (_, stderr, code) = run_cli(dir.path(), &["task", "done", "no-such-task"]);
    assert_ne!(code, 0);
    assert!(stderr.contains("error:"));
}

#[test]
fn test_task_delete_leaves_tombstone() {
    let dir = tempfile::tempdir().unwrap();
    let id = add_task(dir.path(), "Throwaway");

    let (stdout, stderr, code) = run_cli(dir.path(), &["task", "delete", &id]);
    assert_eq!(code, 0, "task delete failed: {stderr}");
    assert!(stdout.contains(&id));
    assert!(list_json(dir.path()).is_empty());

    let (stdout, _, code) = run_cli(dir.path(), &["tombstones", "count"]);
    assert_eq!(code, 0);
    assert_eq!(stdout.trim(), "1");
}

#[test]
fn test_sync_status_counts_queued_changes() {
    let dir = tempfile::tempdir().unwrap();
    let id = add_task(dir.path(), "Offline edit");
    let (_, _, code) = run_cli(dir.path(), &["task", "done", &id]);
    assert_eq!(code, 0);

    let (stdout, stderr, code) = run_cli(dir.path(), &["sync", "status", "--json"]);
    assert_eq!(code, 0, "sync status failed: {stderr}");
    let status: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(status["pending_count"], 2);
    assert!(status["device_id"].as_str().is_some_and(|d| !d.is_empty()));
}

#[test]
fn test_sync_manifest_lists_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let id = add_task(dir.path(), "Manifested");

    let (stdout, stderr, code) = run_cli(dir.path(), &["sync", "manifest"]);
    assert_eq!(code, 0, "sync manifest failed: {stderr}");
    let entries: Vec<serde_json::Value> = serde_json::from_str(&stdout).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["taskId"], id.as_str());
    assert_eq!(entries[0]["eventVersion"], 1);
}

#[test]
fn test_tombstones_purge_keeps_recent() {
    let dir = tempfile::tempdir().unwrap();
    let id = add_task(dir.path(), "Gone soon");
    let (_, _, code) = run_cli(dir.path(), &["task", "delete", &id]);
    assert_eq!(code, 0);

    let (stdout, stderr, code) = run_cli(dir.path(), &["tombstones", "purge"]);
    assert_eq!(code, 0, "purge failed: {stderr}");
    assert!(stdout.contains("Purged 0 tombstone(s)"));

    let (stdout, _, code) = run_cli(dir.path(), &["tombstones", "purge", "--older-than-days", "0"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("Purged 1 tombstone(s)"));

    let (stdout, _, _) = run_cli(dir.path(), &["tombstones", "count"]);
    assert_eq!(stdout.trim(), "0");
}

#[test]
fn test_tombstones_purge_rejects_negative_age() {
    let dir = tempfile::tempdir().unwrap();
    let (_, stderr, code) = run_cli(dir.path(), &["tombstones", "purge", "--older-than-days=-1"]);
    assert_ne!(code, 0);
    assert!(stderr.contains("must not be negative"));
}

#[test]
fn test_out_of_range_durations_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let id = add_task(dir.path(), "Far future");

    let (_, stderr, code) = run_cli(
        dir.path(),
        &["task", "snooze", &id, "--minutes", "9223372036854775807"],
    );
    assert_ne!(code, 0);
    assert!(stderr.contains("--minutes is out of range"), "{stderr}");
    assert_eq!(list_json(dir.path())[0]["state"], "READY");

    let (_, stderr, code) = run_cli(
        dir.path(),
        &["tombstones", "purge", "--older-than-days", "9223372036854775807"],
    );
    assert_ne!(code, 0);
    assert!(stderr.contains("--older-than-days is out of range"), "{stderr}");
}

#[test]
fn test_config_reset_then_list() {
    let dir = tempfile::tempdir().unwrap();
    let (stdout, stderr, code) = run_cli(dir.path(), &["config", "reset"]);
    assert_eq!(code, 0, "config reset failed: {stderr}");
    assert!(stdout.contains("config reset to defaults"));
    assert!(dir.path().join("config.toml").exists());

    let (stdout, stderr, code) = run_cli(dir.path(), &["config", "list"]);
    assert_eq!(code, 0, "config list failed: {stderr}");
    let config: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(config["sync"]["listen_port"], 27850);
    assert_eq!(config["sync"]["send_timeout_ms"], 5000);
}
