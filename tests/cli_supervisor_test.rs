//! Integration tests for `tn status`, `tn start`, `tn stop`, `tn up` and `tn down`.
//!
//! Nothing here launches a real inference backend: the backend is either
//! missing a model or pointed at an executable that does not exist.

mod common;

use common::{DEAD_PID, TestEnv, free_port, parse_json};
use predicates::prelude::*;
use std::fs;

#[test]
fn test_status_with_nothing_running() {
    let env = TestEnv::new();

    let output = env.tn().arg("status").output().unwrap();
    assert!(output.status.success());

    let json = parse_json(&output.stdout);
    let processes = json["processes"].as_array().unwrap();
    assert_eq!(processes.len(), 2);
    assert_eq!(processes[0]["kind"], "backend");
    assert_eq!(processes[0]["state"], "stopped");
    assert_eq!(processes[1]["kind"], "gateway");
    assert_eq!(processes[1]["state"], "stopped");
    assert_eq!(json["api_url"], "http://127.0.0.1:8090");
}

#[test]
fn test_status_reports_dead_pid_without_cleanup() {
    let env = TestEnv::new();
    fs::create_dir_all(env.data_path().join("run")).unwrap();
    fs::write(env.pid_path("backend"), format!("{}\n", DEAD_PID)).unwrap();

    let output = env.tn().arg("status").output().unwrap();
    let json = parse_json(&output.stdout);

    assert_eq!(json["processes"][0]["state"], "dead");
    assert_eq!(json["processes"][0]["pid"], DEAD_PID);
    assert!(env.pid_path("backend").exists());
}

#[test]
fn test_status_human() {
    let env = TestEnv::new();

    env.tn()
        .args(["-H", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("backend"))
        .stdout(predicate::str::contains("gateway"))
        .stdout(predicate::str::contains("stopped"));
}

#[test]
fn test_stop_when_nothing_is_running() {
    let env = TestEnv::new();
    let port = free_port().to_string();

    let output = env
        .tn()
        .args(["stop", "gateway", "--api-port", &port])
        .output()
        .unwrap();
    assert!(output.status.success());

    let json = parse_json(&output.stdout);
    assert_eq!(json["kind"], "gateway");
    assert_eq!(json["method"], "not_running");
}

#[test]
fn test_stop_cleans_up_stale_pid_file() {
    let env = TestEnv::new();
    fs::create_dir_all(env.data_path().join("run")).unwrap();
    fs::write(env.pid_path("backend"), format!("{}\n", DEAD_PID)).unwrap();

    let output = env.tn().args(["stop", "backend"]).output().unwrap();
    assert!(output.status.success());

    let json = parse_json(&output.stdout);
    assert_eq!(json["method"], "already_gone");
    assert_eq!(json["pid"], DEAD_PID);
    assert!(!env.pid_path("backend").exists());
}

#[test]
fn test_stop_removes_corrupt_pid_file() {
    let env = TestEnv::new();
    fs::create_dir_all(env.data_path().join("run")).unwrap();
    fs::write(env.pid_path("backend"), "not-a-pid").unwrap();
    let port = free_port().to_string();

    let output = env
        .tn()
        .args(["stop", "backend", "--backend-port", &port])
        .output()
        .unwrap();
    assert!(output.status.success());

    assert_eq!(parse_json(&output.stdout)["method"], "not_running");
    assert!(!env.pid_path("backend").exists());
}

#[test]
fn test_start_backend_without_model_fails() {
    let env = TestEnv::new();

    env.tn()
        .args(["start", "backend"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No model artifact found"));

    assert!(!env.pid_path("backend").exists());
}

#[test]
fn test_start_backend_with_missing_executable_fails() {
    let env = TestEnv::new();
    let models = env.work_path().join("models");
    fs::create_dir_all(&models).unwrap();
    fs::write(models.join("tiny.gguf"), b"GGUF").unwrap();

    env.tn()
        .args(["start", "backend", "--backend-bin", "/definitely/not/here/llama-server"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Executable not found"));

    assert!(!env.pid_path("backend").exists());
}

#[test]
fn test_down_with_nothing_running() {
    let env = TestEnv::new();
    let api_port = free_port().to_string();
    let backend_port = free_port().to_string();

    let output = env
        .tn()
        .args(["down", "--api-port", &api_port, "--backend-port", &backend_port])
        .output()
        .unwrap();
    assert!(output.status.success());

    let json = parse_json(&output.stdout);
    assert_eq!(json["gateway"]["method"], "not_running");
    assert_eq!(json["backend"]["method"], "not_running");
}
