//! Operating system side of process supervision.
//!
//! The supervisor never touches processes directly; it goes through a
//! [`ProcessHost`]. [`SystemHost`] is the real implementation.

use super::SupervisorError;
use serde_json::json;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

/// Timeout for a single readiness probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

/// A trivial request used to check that a process is serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// `POST <url>` with a one-token completion request
    Completion { url: String },
    /// `GET <url>` expecting a 2xx
    Health { url: String },
}

impl Probe {
    pub fn url(&self) -> &str {
        match self {
            Probe::Completion { url } | Probe::Health { url } => url,
        }
    }
}

/// Everything needed to launch a detached process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Variables removed from the inherited environment
    pub env_remove: Vec<String>,
    /// stdout and stderr are appended here
    pub log_path: PathBuf,
}

pub trait ProcessHost {
    /// Whether a process with this PID exists.
    fn is_alive(&self, pid: u32) -> bool;

    /// Send a signal. Returns false if the process doesn't exist.
    fn signal(&self, pid: u32, signal: Signal) -> bool;

    /// PID of a process whose command line matches `pattern`.
    fn find_by_pattern(&self, pattern: &str) -> Option<u32>;

    /// Launch a detached process and return its PID.
    fn spawn(&self, spec: &LaunchSpec) -> Result<u32, SupervisorError>;

    /// Issue one readiness probe. True on a 2xx answer.
    fn probe(&self, probe: &Probe) -> bool;

    fn sleep(&self, duration: Duration);
}

/// [`ProcessHost`] backed by the local operating system.
#[derive(Debug, Default)]
pub struct SystemHost {
    /// Children launched by this host, kept so exited ones can be reaped
    children: Mutex<Vec<Child>>,
}

impl SystemHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reap `pid` if it is one of our children and has exited.
    fn reap(&self, pid: u32) {
        let mut children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
        children.retain_mut(|child| child.id() != pid || matches!(child.try_wait(), Ok(None)));
    }
}

impl ProcessHost for SystemHost {
    fn is_alive(&self, pid: u32) -> bool {
        self.reap(pid);
        pid_alive(pid)
    }

    fn signal(&self, pid: u32, signal: Signal) -> bool {
        send_signal(pid, signal)
    }

    fn find_by_pattern(&self, pattern: &str) -> Option<u32> {
        let output = Command::new("pgrep").args(["-f", "--", pattern]).output().ok()?;
        if !output.status.success() {
            return None;
        }

        let own_pid = std::process::id();
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.trim().parse::<u32>().ok())
            .find(|pid| *pid != own_pid)
    }

    fn spawn(&self, spec: &LaunchSpec) -> Result<u32, SupervisorError> {
        if let Some(parent) = spec.log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_path)?;
        let stderr = stdout.try_clone()?;

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        for key in &spec.env_remove {
            command.env_remove(key);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        // Own process group, so a Ctrl+C aimed at `tn` does not reach it.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let program = spec.program.display().to_string();
        let child = command.spawn().map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                SupervisorError::ExecutableNotFound(program.clone())
            } else {
                SupervisorError::Spawn {
                    program: program.clone(),
                    source: e,
                }
            }
        })?;

        let pid = child.id();
        tracing::info!(pid, program = %program, log = %spec.log_path.display(), "spawned process");
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(child);
        Ok(pid)
    }

    fn probe(&self, probe: &Probe) -> bool {
        let result = match probe {
            Probe::Completion { url } => ureq::post(url).timeout(PROBE_TIMEOUT).send_json(json!({
                "prompt": "ping",
                "n_predict": 1,
                "max_tokens": 1,
                "stream": false,
            })),
            Probe::Health { url } => ureq::get(url).timeout(PROBE_TIMEOUT).call(),
        };

        match result {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(url = probe.url(), error = %e, "probe failed");
                false
            }
        }
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Check whether a PID exists.
///
/// EPERM means the process exists but belongs to someone else.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }

    // SAFETY: signal 0 only performs the existence and permission checks.
    let rc = unsafe { libc::kill(pid, 0) };
    let exists = rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    exists && !is_zombie(pid)
}

/// An exited child nobody has reaped yet still answers kill(0).
#[cfg(target_os = "linux")]
fn is_zombie(pid: libc::pid_t) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // The state letter follows the parenthesised command name.
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        == Some("Z")
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: libc::pid_t) -> bool {
    false
}

#[cfg(windows)]
pub fn pid_alive(pid: u32) -> bool {
    Command::new("tasklist")
        .args(["/FI", &format!("PID eq {}", pid), "/NH"])
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }

    let signo = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: plain kill(2) on a positive PID; never a process group.
    unsafe { libc::kill(pid, signo) == 0 }
}

/// taskkill without /F asks politely, with /F it terminates.
#[cfg(windows)]
fn send_signal(pid: u32, signal: Signal) -> bool {
    let pid = pid.to_string();
    let args: Vec<&str> = match signal {
        Signal::Term => vec!["/PID", &pid],
        Signal::Kill => vec!["/F", "/PID", &pid],
    };

    Command::new("taskkill")
        .args(&args)
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}
