//! Process supervisor for the inference backend and the API gateway.
//!
//! Each managed process moves through
//! `Unknown -> Starting -> Running -> Stopping -> Stopped`, or ends up `Dead`
//! when it vanishes unexpectedly. The supervisor keeps that state in memory;
//! PID files under `<data_dir>/run/` let a later invocation pick up processes
//! started by an earlier one.

mod host;
mod model;
mod pid_file;

pub use host::{LaunchSpec, Probe, ProcessHost, Signal, SystemHost, pid_alive};
pub use model::{MODEL_EXTENSION, WELL_KNOWN_MODEL_FILES, resolve_model_artifact};
pub use pid_file::PidFile;

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable the gateway reads its backend URL from.
pub const BACKEND_URL_ENV: &str = "TN_BACKEND_URL";

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const KILL_SETTLE: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("No model artifact found (searched: {searched})")]
    ModelNotFound { searched: String },

    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Supervisor IO error: {0}")]
    Io(#[from] io::Error),

    #[error("{kind} (PID {pid}) exited during startup")]
    ExitedDuringStartup { kind: ProcessKind, pid: u32 },

    #[error("Could not terminate PID {pid}")]
    Signal { pid: u32 },
}

/// The processes the supervisor manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProcessKind {
    Backend,
    Gateway,
}

impl ProcessKind {
    pub const ALL: [ProcessKind; 2] = [ProcessKind::Backend, ProcessKind::Gateway];

    pub fn name(&self) -> &'static str {
        match self {
            ProcessKind::Backend => "backend",
            ProcessKind::Gateway => "gateway",
        }
    }
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Unknown,
    Starting,
    Running,
    Stopping,
    Stopped,
    Dead,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Unknown => "unknown",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
            ProcessState::Stopped => "stopped",
            ProcessState::Dead => "dead",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the supervisor knows about one process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagedProcess {
    pub kind: ProcessKind,
    pub pid: Option<u32>,
    pub state: ProcessState,
    /// Whether the process answered a readiness probe
    pub verified: bool,
}

impl ManagedProcess {
    fn unknown(kind: ProcessKind) -> Self {
        Self {
            kind,
            pid: None,
            state: ProcessState::Unknown,
            verified: false,
        }
    }
}

/// How to launch the inference backend (a llama.cpp-style server).
#[derive(Debug, Clone)]
pub struct BackendLaunch {
    pub program: String,
    pub host: String,
    pub port: u16,
    pub model_path: Option<PathBuf>,
    pub model_dirs: Vec<PathBuf>,
    pub threads: u32,
    pub ctx_size: u32,
}

impl BackendLaunch {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// How to launch the gateway (this binary running `serve`).
#[derive(Debug, Clone)]
pub struct GatewayLaunch {
    pub program: PathBuf,
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub config_path: Option<PathBuf>,
    /// Explicitly configured backend URL; otherwise the managed backend's
    /// address is used while it is running
    pub backend_url: Option<String>,
}

impl GatewayLaunch {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Directory for PID files and process logs
    pub run_dir: PathBuf,
    pub backend: BackendLaunch,
    pub gateway: GatewayLaunch,
    /// Readiness probes issued after launch
    pub health_retries: u32,
    pub health_delay: Duration,
    /// Time between SIGTERM and SIGKILL
    pub stop_grace: Duration,
}

/// Result of a start request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartOutcome {
    pub kind: ProcessKind,
    pub pid: u32,
    pub state: ProcessState,
    pub verified: bool,
    /// A live process was already recorded; nothing was launched
    pub already_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum StopOutcome {
    /// Nothing recorded and nothing matched
    NotRunning,
    /// The recorded PID was already gone
    AlreadyGone { pid: u32 },
    /// Exited after SIGTERM
    Terminated { pid: u32 },
    /// Needed SIGKILL after the grace period
    Killed { pid: u32 },
}

pub struct UpReport {
    pub backend: Result<StartOutcome, SupervisorError>,
    pub gateway: Result<StartOutcome, SupervisorError>,
}

pub struct DownReport {
    pub gateway: Result<StopOutcome, SupervisorError>,
    pub backend: Result<StopOutcome, SupervisorError>,
}

pub struct Supervisor<H: ProcessHost = SystemHost> {
    settings: SupervisorSettings,
    host: H,
    processes: HashMap<ProcessKind, ManagedProcess>,
}

impl<H: ProcessHost> Supervisor<H> {
    pub fn new(settings: SupervisorSettings, host: H) -> Self {
        let processes = ProcessKind::ALL
            .iter()
            .map(|kind| (*kind, ManagedProcess::unknown(*kind)))
            .collect();
        Self {
            settings,
            host,
            processes,
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn pid_file(&self, kind: ProcessKind) -> PidFile {
        PidFile::new(&self.settings.run_dir, kind.name())
    }

    pub fn log_path(&self, kind: ProcessKind) -> PathBuf {
        self.settings.run_dir.join(format!("{}.log", kind.name()))
    }

    /// The in-memory record for a process.
    pub fn process(&self, kind: ProcessKind) -> &ManagedProcess {
        &self.processes[&kind]
    }

    fn record(&mut self, kind: ProcessKind, pid: Option<u32>, state: ProcessState, verified: bool) {
        tracing::debug!(process = %kind, ?pid, %state, verified, "process state");
        self.processes.insert(
            kind,
            ManagedProcess {
                kind,
                pid,
                state,
                verified,
            },
        );
    }

    /// PID from the PID file. An unreadable file is removed and treated as absent.
    fn recorded_pid(&self, kind: ProcessKind) -> Result<Option<u32>, SupervisorError> {
        let pid_file = self.pid_file(kind);
        match pid_file.read() {
            Ok(pid) => Ok(pid),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                tracing::warn!(process = %kind, error = %e, "removing unreadable PID file");
                pid_file.delete()?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// `pgrep -f` pattern used when no PID file is present.
    pub fn process_pattern(&self, kind: ProcessKind) -> String {
        match kind {
            ProcessKind::Backend => {
                let program = Path::new(&self.settings.backend.program)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| self.settings.backend.program.clone());
                format!("{} .*--port {}", program, self.settings.backend.port)
            }
            ProcessKind::Gateway => format!("--api-port {} serve", self.settings.gateway.port),
        }
    }

    fn probe_for(&self, kind: ProcessKind) -> Probe {
        match kind {
            ProcessKind::Backend => Probe::Completion {
                url: format!("{}/completion", self.settings.backend.base_url()),
            },
            ProcessKind::Gateway => Probe::Health {
                url: format!("{}/api/health", self.settings.gateway.base_url()),
            },
        }
    }

    /// Backend URL handed to the gateway, if any.
    pub fn gateway_backend_url(&self) -> Option<String> {
        if let Some(url) = &self.settings.gateway.backend_url {
            return Some(url.clone());
        }
        match self.recorded_pid(ProcessKind::Backend) {
            Ok(Some(pid)) if self.host.is_alive(pid) => Some(self.settings.backend.base_url()),
            _ => None,
        }
    }

    fn launch_spec(&self, kind: ProcessKind) -> Result<LaunchSpec, SupervisorError> {
        let log_path = self.log_path(kind);
        match kind {
            ProcessKind::Backend => {
                let backend = &self.settings.backend;
                let model = resolve_model_artifact(backend.model_path.as_deref(), &backend.model_dirs)?;
                tracing::info!(model = %model.display(), "resolved backend model");
                Ok(LaunchSpec {
                    program: PathBuf::from(&backend.program),
                    args: vec![
                        "-m".to_string(),
                        model.display().to_string(),
                        "--host".to_string(),
                        backend.host.clone(),
                        "--port".to_string(),
                        backend.port.to_string(),
                        "-t".to_string(),
                        backend.threads.to_string(),
                        "-c".to_string(),
                        backend.ctx_size.to_string(),
                    ],
                    env: Vec::new(),
                    env_remove: Vec::new(),
                    log_path,
                })
            }
            ProcessKind::Gateway => {
                let gateway = &self.settings.gateway;
                let mut args = vec![
                    "--data-dir".to_string(),
                    gateway.data_dir.display().to_string(),
                ];
                if let Some(config) = &gateway.config_path {
                    args.push("--config".to_string());
                    args.push(config.display().to_string());
                }
                args.extend([
                    "--api-host".to_string(),
                    gateway.host.clone(),
                    "--api-port".to_string(),
                    gateway.port.to_string(),
                    "serve".to_string(),
                ]);

                let (env, env_remove) = match self.gateway_backend_url() {
                    Some(url) => (vec![(BACKEND_URL_ENV.to_string(), url)], Vec::new()),
                    None => (Vec::new(), vec![BACKEND_URL_ENV.to_string()]),
                };

                Ok(LaunchSpec {
                    program: gateway.program.clone(),
                    args,
                    env,
                    env_remove,
                    log_path,
                })
            }
        }
    }

    /// Start a process unless a live one is already recorded.
    ///
    /// After launch the process is probed `health_retries` times. A process
    /// that never answers is still reported `Running`, unverified, with a
    /// warning; one that exits while being probed is `Dead`.
    pub fn start(&mut self, kind: ProcessKind) -> Result<StartOutcome, SupervisorError> {
        let pid_file = self.pid_file(kind);
        let probe = self.probe_for(kind);

        if let Some(pid) = self.recorded_pid(kind)? {
            if self.host.is_alive(pid) {
                let verified = self.host.probe(&probe);
                tracing::info!(process = %kind, pid, verified, "already running");
                self.record(kind, Some(pid), ProcessState::Running, verified);
                return Ok(StartOutcome {
                    kind,
                    pid,
                    state: ProcessState::Running,
                    verified,
                    already_running: true,
                    warning: None,
                });
            }
            tracing::info!(process = %kind, pid, "removing orphaned PID file");
            pid_file.delete()?;
        }

        let spec = self.launch_spec(kind)?;

        self.record(kind, None, ProcessState::Starting, false);
        let pid = match self.host.spawn(&spec) {
            Ok(pid) => pid,
            Err(e) => {
                self.record(kind, None, ProcessState::Stopped, false);
                return Err(e);
            }
        };
        // An unrecorded process could never be stopped again.
        if let Err(e) = pid_file.write(pid) {
            tracing::error!(process = %kind, pid, error = %e, "cannot write PID file, killing process");
            self.host.signal(pid, Signal::Kill);
            self.record(kind, None, ProcessState::Stopped, false);
            return Err(e.into());
        }
        self.record(kind, Some(pid), ProcessState::Starting, false);

        let retries = self.settings.health_retries;
        for attempt in 1..=retries {
            if !self.host.is_alive(pid) {
                tracing::error!(process = %kind, pid, attempt, "process exited during startup");
                pid_file.delete()?;
                self.record(kind, Some(pid), ProcessState::Dead, false);
                return Err(SupervisorError::ExitedDuringStartup { kind, pid });
            }
            if self.host.probe(&probe) {
                tracing::info!(process = %kind, pid, attempt, "process is ready");
                self.record(kind, Some(pid), ProcessState::Running, true);
                return Ok(StartOutcome {
                    kind,
                    pid,
                    state: ProcessState::Running,
                    verified: true,
                    already_running: false,
                    warning: None,
                });
            }
            if attempt < retries {
                self.host.sleep(self.settings.health_delay);
            }
        }

        let warning = format!(
            "{} (PID {}) did not answer {} after {} attempts; continuing unverified",
            kind,
            pid,
            probe.url(),
            retries
        );
        tracing::warn!("{}", warning);
        self.record(kind, Some(pid), ProcessState::Running, false);
        Ok(StartOutcome {
            kind,
            pid,
            state: ProcessState::Running,
            verified: false,
            already_running: false,
            warning: Some(warning),
        })
    }

    /// Stop a process: SIGTERM, wait out the grace period, then SIGKILL.
    /// Stopping something that is not running is a no-op.
    pub fn stop(&mut self, kind: ProcessKind) -> Result<StopOutcome, SupervisorError> {
        let pid_file = self.pid_file(kind);

        let pid = match self.recorded_pid(kind)? {
            Some(pid) => Some(pid),
            None => {
                let pattern = self.process_pattern(kind);
                let found = self.host.find_by_pattern(&pattern);
                if let Some(pid) = found {
                    tracing::info!(process = %kind, pid, pattern = %pattern, "no PID file, matched by pattern");
                }
                found
            }
        };

        let Some(pid) = pid else {
            self.record(kind, None, ProcessState::Stopped, false);
            return Ok(StopOutcome::NotRunning);
        };

        if !self.host.is_alive(pid) {
            pid_file.delete()?;
            self.record(kind, None, ProcessState::Stopped, false);
            return Ok(StopOutcome::AlreadyGone { pid });
        }

        self.record(kind, Some(pid), ProcessState::Stopping, false);
        tracing::info!(process = %kind, pid, "sending SIGTERM");

        if !self.host.signal(pid, Signal::Term) && !self.host.is_alive(pid) {
            pid_file.delete()?;
            self.record(kind, None, ProcessState::Stopped, false);
            return Ok(StopOutcome::AlreadyGone { pid });
        }

        let polls = (self.settings.stop_grace.as_millis() / STOP_POLL_INTERVAL.as_millis()).max(1);
        for _ in 0..polls {
            self.host.sleep(STOP_POLL_INTERVAL);
            if !self.host.is_alive(pid) {
                pid_file.delete()?;
                self.record(kind, None, ProcessState::Stopped, false);
                tracing::info!(process = %kind, pid, "stopped gracefully");
                return Ok(StopOutcome::Terminated { pid });
            }
        }

        tracing::warn!(process = %kind, pid, "graceful shutdown timed out, sending SIGKILL");
        self.host.signal(pid, Signal::Kill);
        self.host.sleep(KILL_SETTLE);
        if self.host.is_alive(pid) {
            self.record(kind, Some(pid), ProcessState::Running, false);
            return Err(SupervisorError::Signal { pid });
        }

        pid_file.delete()?;
        self.record(kind, None, ProcessState::Stopped, false);
        Ok(StopOutcome::Killed { pid })
    }

    /// Current state of every process, derived from PID files and liveness.
    /// Nothing is started, stopped or deleted.
    pub fn status(&self) -> Vec<ManagedProcess> {
        ProcessKind::ALL
            .iter()
            .map(|kind| {
                let known = &self.processes[kind];
                match self.pid_file(*kind).read() {
                    Ok(Some(pid)) if self.host.is_alive(pid) => ManagedProcess {
                        kind: *kind,
                        pid: Some(pid),
                        state: ProcessState::Running,
                        verified: known.pid == Some(pid) && known.verified,
                    },
                    Ok(Some(pid)) => ManagedProcess {
                        kind: *kind,
                        pid: Some(pid),
                        state: ProcessState::Dead,
                        verified: false,
                    },
                    Ok(None) | Err(_) => ManagedProcess {
                        kind: *kind,
                        pid: None,
                        state: ProcessState::Stopped,
                        verified: false,
                    },
                }
            })
            .collect()
    }

    /// Start the backend, then the gateway. A backend failure does not stop
    /// the gateway from starting; it then answers with the mock adapter.
    pub fn up(&mut self) -> UpReport {
        let backend = self.start(ProcessKind::Backend);
        if let Err(e) = &backend {
            tracing::error!(error = %e, "backend failed to start");
        }
        let gateway = self.start(ProcessKind::Gateway);
        UpReport { backend, gateway }
    }

    /// Stop the gateway, then the backend.
    pub fn down(&mut self) -> DownReport {
        let gateway = self.stop(ProcessKind::Gateway);
        let backend = self.stop(ProcessKind::Backend);
        DownReport { gateway, backend }
    }
}
