//! App process lifecycle against small shell-script apps.
#![cfg(unix)]

use fob_harness::{AppCommand, AppProcess, ProcessError, ProcessStatus};
use serial_test::serial;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn is_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[tokio::test]
#[serial]
async fn ready_line_ends_the_wait() {
    let dir = TempDir::new().unwrap();
    let bin = script(
        &dir,
        "app",
        "sleep 0.1\necho \"INFO engine is listening on :$2\"\nexec sleep 30",
    );
    let mut app = AppProcess::new(AppCommand::new(bin, 9123));

    let start = Instant::now();
    app.start(Duration::from_secs(60)).await.unwrap();

    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(app.is_running());
    let pid = app.pid().unwrap();
    assert!(is_alive(pid));

    app.kill().await.unwrap();
    assert!(matches!(app.status(), ProcessStatus::Exited(_)));
    assert!(!is_alive(pid));
}

#[tokio::test]
#[serial]
async fn custom_ready_pattern() {
    let dir = TempDir::new().unwrap();
    let bin = script(&dir, "app", "echo 'Listening on 127.0.0.1'\nexec sleep 30");
    let command = AppCommand::new(bin, 9123).with_ready_patterns(vec!["Listening on".to_string()]);
    let mut app = AppProcess::new(command);

    app.start(Duration::from_secs(10)).await.unwrap();
    app.kill().await.unwrap();
}

#[tokio::test]
#[serial]
async fn silent_app_times_out_and_is_killed() {
    let dir = TempDir::new().unwrap();
    let bin = script(&dir, "app", "exec sleep 30");
    let mut app = AppProcess::new(AppCommand::new(bin, 9123));

    let start = Instant::now();
    let err = app.start(Duration::from_millis(300)).await.unwrap_err();

    assert!(matches!(err, ProcessError::StartupTimeout { .. }));
    assert!(start.elapsed() >= Duration::from_millis(300));
    assert!(start.elapsed() < Duration::from_secs(10));
    let pid = app.pid().unwrap();
    assert!(!is_alive(pid));
    assert!(!app.is_running());
}

#[tokio::test]
#[serial]
async fn early_exit_is_reported() {
    let dir = TempDir::new().unwrap();
    let bin = script(&dir, "app", "echo booting\nexit 3");
    let mut app = AppProcess::new(AppCommand::new(bin, 9123));

    let err = app.start(Duration::from_secs(60)).await.unwrap_err();

    match err {
        ProcessError::Exited { status } => assert_eq!(status.code(), Some(3)),
        other => panic!("expected early exit, got {other:?}"),
    }

    // Killing an exited app is a no-op, twice
    app.kill().await.unwrap();
    app.kill().await.unwrap();
    assert!(matches!(app.status(), ProcessStatus::Exited(_)));
}

#[tokio::test]
#[serial]
async fn restart_replaces_previous_instance() {
    let dir = TempDir::new().unwrap();
    let bin = script(&dir, "app", "echo 'engine is listening on'\nexec sleep 30");
    let mut app = AppProcess::new(AppCommand::new(bin, 9123));

    app.start(Duration::from_secs(10)).await.unwrap();
    let first = app.pid().unwrap();
    app.start(Duration::from_secs(10)).await.unwrap();
    let second = app.pid().unwrap();

    assert_ne!(first, second);
    assert!(!is_alive(first));
    app.kill().await.unwrap();
}

#[tokio::test]
#[serial]
async fn run_waits_for_exit() {
    let dir = TempDir::new().unwrap();
    let bin = script(&dir, "app", "test \"$1\" = \"--port=9123\" || exit 9\nexit 0");
    let mut app = AppProcess::new(AppCommand::new(bin, 9123));

    let status = app.run().await.unwrap();
    assert!(status.success());
}
