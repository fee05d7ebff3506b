//! End-to-end tests for `replayctl`.
//!
//! Each test gets its own HOME and XDG directories so the default config and
//! database locations point into a temp dir.

use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;
use tempfile::TempDir;

fn replayctl(temp: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_replayctl"))
        .env("HOME", temp)
        .env("XDG_CONFIG_HOME", temp.join("config"))
        .env("XDG_DATA_HOME", temp.join("data"))
        .env_remove("RUST_LOG")
        .args(args)
        .output()
        .expect("failed to run replayctl")
}

fn write_script(temp: &Path, name: &str, lines: &[&str]) -> String {
    let path = temp.join(name);
    std::fs::write(&path, lines.join("\n")).unwrap();
    path.display().to_string()
}

fn run_json(temp: &Path, script: &str) -> Value {
    let output = replayctl(temp, &["simulate", script, "--json"]);
    assert!(
        output.status.success(),
        "simulate should succeed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

fn segment_ids(report: &Value) -> Vec<u64> {
    report["segments"]
        .as_array()
        .unwrap()
        .iter()
        .map(|segment| segment["segment_id"].as_u64().unwrap())
        .collect()
}

/// A session recording flushes on the debounce and again after a click.
#[test]
fn test_simulate_session_recording() {
    let temp = TempDir::new().unwrap();
    let script = write_script(
        temp.path(),
        "page.jsonl",
        &[
            r#"{"step": "start_session"}"#,
            r#"{"step": "advance", "ms": 6000}"#,
            r#"{"step": "click"}"#,
            r#"{"step": "advance", "ms": 6000}"#,
        ],
    );

    let report = run_json(temp.path(), &script);
    assert_eq!(segment_ids(&report), vec![0, 1]);
    assert_eq!(report["status"], "recording");
    assert_eq!(report["mode"], "session");
}

/// A second run against the same database continues the sticky session.
#[test]
fn test_simulate_reload_continues_session() {
    let temp = TempDir::new().unwrap();
    let first = write_script(
        temp.path(),
        "first.jsonl",
        &[
            r#"{"step": "start_session"}"#,
            r#"{"step": "advance", "ms": 6000}"#,
            r#"{"step": "click"}"#,
            r#"{"step": "advance", "ms": 6000}"#,
        ],
    );
    let reload = write_script(
        temp.path(),
        "reload.jsonl",
        &[r#"{"step": "start"}"#, r#"{"step": "advance", "ms": 6000}"#],
    );

    let first = run_json(temp.path(), &first);
    let second = run_json(temp.path(), &reload);

    assert_eq!(second["replay_id"], first["replay_id"]);
    assert_eq!(segment_ids(&second), vec![2]);
}

/// `session show` and `session clear` operate on what simulate persisted.
#[test]
fn test_session_show_and_clear() {
    let temp = TempDir::new().unwrap();
    let script = write_script(
        temp.path(),
        "page.jsonl",
        &[
            r#"{"step": "start_session"}"#,
            r#"{"step": "advance", "ms": 6000}"#,
        ],
    );
    let report = run_json(temp.path(), &script);
    let replay_id = report["replay_id"].as_str().unwrap();

    let show = replayctl(temp.path(), &["session", "show"]);
    assert!(show.status.success());
    let stdout = String::from_utf8_lossy(&show.stdout);
    assert!(stdout.contains(&format!("Replay: {replay_id}")));
    assert!(stdout.contains("Next segment: 1"));

    let clear = replayctl(temp.path(), &["session", "clear"]);
    assert!(clear.status.success());
    assert_eq!(
        String::from_utf8_lossy(&clear.stdout),
        "Cleared persisted session.\n"
    );

    let show = replayctl(temp.path(), &["session", "show"]);
    assert_eq!(
        String::from_utf8_lossy(&show.stdout),
        "No persisted session.\n"
    );
}

/// A bad step fails the run and names its line.
#[test]
fn test_simulate_rejects_bad_script() {
    let temp = TempDir::new().unwrap();
    let script = write_script(
        temp.path(),
        "bad.jsonl",
        &[r#"{"step": "start"}"#, r#"{"step": "teleport"}"#],
    );

    let output = replayctl(temp.path(), &["simulate", &script]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid step on line 2"));
}

/// An unreachable endpoint keeps the events and reports the failure.
#[test]
fn test_simulate_reports_network_failure() {
    let temp = TempDir::new().unwrap();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let endpoint = format!("http://{}/replay", listener.local_addr().unwrap());
    drop(listener);

    let script = write_script(
        temp.path(),
        "page.jsonl",
        &[
            r#"{"step": "start_session"}"#,
            r#"{"step": "advance", "ms": 6000}"#,
        ],
    );

    let output = replayctl(temp.path(), &["simulate", &script, "--endpoint", &endpoint]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Status: recording (session)"));
    assert!(stdout.contains("[failed: network error"));
}
