//! Common test utilities for thinknode integration tests.
//!
//! Provides `TestEnv` for isolated test environments that don't pollute
//! the user's `~/.local/share/thinknode/` directory.

#![allow(dead_code)]

use assert_cmd::Command;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
pub use tempfile::TempDir;

/// Environment variables bound to CLI flags; cleared so the host's
/// environment cannot leak into a test.
const TN_ENV_VARS: &[&str] = &[
    "TN_CONFIG",
    "TN_LOG_JSON",
    "TN_API_HOST",
    "TN_API_PORT",
    "TN_BACKEND_URL",
    "TN_BACKEND_BIN",
    "TN_MODEL_PATH",
    "TN_MODEL_DIR",
    "RUST_LOG",
];

/// A test environment with isolated data storage.
///
/// `work_dir` is the working directory of every `tn` invocation, so the
/// relative `./models` search directory stays inside the sandbox too.
pub struct TestEnv {
    pub work_dir: TempDir,
    pub data_dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            work_dir: TempDir::new().unwrap(),
            data_dir: TempDir::new().unwrap(),
        }
    }

    /// Get a Command for the tn binary with isolated data directory.
    pub fn tn(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_tn"));
        self.isolate(cmd.current_dir(self.work_dir.path()));
        cmd
    }

    /// Same as [`TestEnv::tn`] but for long-running children.
    pub fn tn_std(&self) -> std::process::Command {
        let mut cmd = std::process::Command::new(env!("CARGO_BIN_EXE_tn"));
        cmd.current_dir(self.work_dir.path());
        for var in TN_ENV_VARS {
            cmd.env_remove(var);
        }
        cmd.env("TN_DATA_DIR", self.data_dir.path());
        cmd
    }

    fn isolate<'a>(&self, cmd: &'a mut Command) -> &'a mut Command {
        for var in TN_ENV_VARS {
            cmd.env_remove(var);
        }
        cmd.env("TN_DATA_DIR", self.data_dir.path())
    }

    pub fn data_path(&self) -> &Path {
        self.data_dir.path()
    }

    pub fn work_path(&self) -> &Path {
        self.work_dir.path()
    }

    pub fn pid_path(&self, name: &str) -> PathBuf {
        self.data_path().join("run").join(format!("{}.pid", name))
    }

    pub fn write_config(&self, contents: &str) {
        std::fs::write(self.data_path().join("config.kdl"), contents).unwrap();
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// A port nothing is listening on right now.
pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// A PID that is never alive (above any kernel's pid_max).
pub const DEAD_PID: u32 = 2_147_483_646;

/// Parse a JSON line from command output.
pub fn parse_json(bytes: &[u8]) -> serde_json::Value {
    serde_json::from_slice(bytes).unwrap()
}
