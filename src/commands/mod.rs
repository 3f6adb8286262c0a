//! Command implementations for the `tn` CLI.
//!
//! Each command returns a result type implementing [`Output`], printed as JSON
//! by default or as text with `-H`.

use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::ResolvedConfig;
use crate::gateway;
use crate::inference::InferenceAdapter;
use crate::service::NodeService;
use crate::storage::{self, Storage};
use crate::supervisor::{
    ManagedProcess, PidFile, ProcessKind, StartOutcome, StopOutcome, Supervisor, SupervisorError,
    SystemHost, pid_alive,
};
use crate::{Error, Result};

/// Command results that can be serialized to JSON or formatted for humans.
pub trait Output {
    /// Serialize to JSON string.
    fn to_json(&self) -> String;

    /// Format for human-readable output.
    fn to_human(&self) -> String;
}

fn to_json_string<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!(r#"{{"error": "{}"}}"#, e))
}

fn supervisor(config: &ResolvedConfig) -> Result<Supervisor> {
    let exe = std::env::current_exe()?;
    Ok(Supervisor::new(
        config.supervisor_settings(exe),
        SystemHost::new(),
    ))
}

// === Serve ===

/// Run the REST API in the foreground until Ctrl+C or SIGTERM.
///
/// The gateway PID file is claimed while serving so `tn status` and
/// `tn stop gateway` see a foreground server too.
pub fn serve(config: &ResolvedConfig) -> Result<()> {
    let storage = Storage::open(&storage::db_path(&config.data_dir))?;
    let adapter = InferenceAdapter::from_settings(&config.inference_settings())?;
    match adapter.backend_url() {
        Some(url) => tracing::info!(backend = url, "using inference backend"),
        None => tracing::info!("no backend configured, replies come from the mock responder"),
    }
    let service = Arc::new(NodeService::new(storage, adapter));

    let pid_file = PidFile::new(&config.run_dir(), ProcessKind::Gateway.name());
    let own_pid = std::process::id();
    let claimed = claim_pid_file(&pid_file, own_pid)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(gateway::start_server(
        service,
        &config.api_host.value,
        config.api_port.value,
    ));

    if claimed && matches!(pid_file.read(), Ok(Some(pid)) if pid == own_pid) {
        pid_file.delete()?;
    }
    result.map_err(|e| Error::Other(format!("Server error: {}", e)))
}

/// Write our PID unless another live gateway already holds the file.
fn claim_pid_file(pid_file: &PidFile, own_pid: u32) -> Result<bool> {
    match pid_file.read() {
        Ok(Some(pid)) if pid == own_pid => Ok(true),
        Ok(Some(pid)) if pid_alive(pid) => {
            tracing::warn!(pid, "another gateway is recorded as running");
            Ok(false)
        }
        _ => {
            pid_file.write(own_pid)?;
            Ok(true)
        }
    }
}

// === Start / Stop ===

#[derive(Serialize)]
pub struct StartResult {
    #[serde(flatten)]
    pub outcome: StartOutcome,
    pub url: String,
    pub log: PathBuf,
}

impl Output for StartResult {
    fn to_json(&self) -> String {
        to_json_string(self)
    }

    fn to_human(&self) -> String {
        let o = &self.outcome;
        let mut lines = Vec::new();
        if o.already_running {
            lines.push(format!("{} already running (PID {})", o.kind, o.pid));
        } else {
            lines.push(format!("Started {} (PID {})", o.kind, o.pid));
        }
        lines.push(format!("  URL: {}", self.url));
        lines.push(format!("  Log: {}", self.log.display()));
        if let Some(warning) = &o.warning {
            lines.push(format!("  Warning: {}", warning));
        }
        lines.join("\n")
    }
}

/// Start one managed process.
pub fn start(config: &ResolvedConfig, kind: ProcessKind) -> Result<StartResult> {
    let mut supervisor = supervisor(config)?;
    let outcome = supervisor.start(kind)?;
    Ok(start_result(&supervisor, outcome))
}

fn start_result(supervisor: &Supervisor, outcome: StartOutcome) -> StartResult {
    let settings = supervisor.settings();
    let url = match outcome.kind {
        ProcessKind::Backend => settings.backend.base_url(),
        ProcessKind::Gateway => settings.gateway.base_url(),
    };
    StartResult {
        url,
        log: supervisor.log_path(outcome.kind),
        outcome,
    }
}

#[derive(Serialize)]
pub struct StopResult {
    pub kind: ProcessKind,
    #[serde(flatten)]
    pub outcome: StopOutcome,
}

impl Output for StopResult {
    fn to_json(&self) -> String {
        to_json_string(self)
    }

    fn to_human(&self) -> String {
        describe_stop(self.kind, &self.outcome)
    }
}

fn describe_stop(kind: ProcessKind, outcome: &StopOutcome) -> String {
    match outcome {
        StopOutcome::NotRunning => format!("{} is not running", kind),
        StopOutcome::AlreadyGone { pid } => {
            format!("{} (PID {}) had already exited; cleaned up", kind, pid)
        }
        StopOutcome::Terminated { pid } => format!("Stopped {} (PID {})", kind, pid),
        StopOutcome::Killed { pid } => {
            format!("Killed {} (PID {}) after the grace period", kind, pid)
        }
    }
}

/// Stop one managed process.
pub fn stop(config: &ResolvedConfig, kind: ProcessKind) -> Result<StopResult> {
    let mut supervisor = supervisor(config)?;
    let outcome = supervisor.stop(kind)?;
    Ok(StopResult { kind, outcome })
}

// === Up / Down ===

/// Outcome of one step of `up` or `down`.
#[derive(Serialize)]
#[serde(untagged)]
pub enum Step<T> {
    Done(T),
    Failed { error: String },
}

impl<T> Step<T> {
    fn from_result(result: std::result::Result<T, SupervisorError>) -> Self {
        match result {
            Ok(value) => Step::Done(value),
            Err(e) => Step::Failed {
                error: e.to_string(),
            },
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Step::Done(_))
    }
}

#[derive(Serialize)]
pub struct UpResult {
    pub backend: Step<StartResult>,
    pub gateway: Step<StartResult>,
    /// Inference mode the gateway runs with
    pub inference: &'static str,
}

impl Output for UpResult {
    fn to_json(&self) -> String {
        to_json_string(self)
    }

    fn to_human(&self) -> String {
        let mut lines = Vec::new();
        for (kind, step) in [
            (ProcessKind::Backend, &self.backend),
            (ProcessKind::Gateway, &self.gateway),
        ] {
            match step {
                Step::Done(result) => lines.push(result.to_human()),
                Step::Failed { error } => lines.push(format!("{} failed: {}", kind, error)),
            }
        }
        lines.push(format!("Inference: {}", self.inference));
        lines.join("\n")
    }
}

/// Start the backend, then the gateway.
pub fn up(config: &ResolvedConfig) -> Result<UpResult> {
    let mut supervisor = supervisor(config)?;
    let report = supervisor.up();
    let inference = if supervisor.gateway_backend_url().is_some() {
        "backend"
    } else {
        "mock"
    };
    let backend = Step::from_result(report.backend.map(|o| start_result(&supervisor, o)));
    let gateway = Step::from_result(report.gateway.map(|o| start_result(&supervisor, o)));
    Ok(UpResult {
        backend,
        gateway,
        inference,
    })
}

#[derive(Serialize)]
pub struct DownResult {
    pub gateway: Step<StopOutcome>,
    pub backend: Step<StopOutcome>,
}

impl DownResult {
    pub fn is_success(&self) -> bool {
        self.gateway.is_done() && self.backend.is_done()
    }
}

impl Output for DownResult {
    fn to_json(&self) -> String {
        to_json_string(self)
    }

    fn to_human(&self) -> String {
        [
            (ProcessKind::Gateway, &self.gateway),
            (ProcessKind::Backend, &self.backend),
        ]
        .iter()
        .map(|(kind, step)| match step {
            Step::Done(outcome) => describe_stop(*kind, outcome),
            Step::Failed { error } => format!("{} failed to stop: {}", kind, error),
        })
        .collect::<Vec<_>>()
        .join("\n")
    }
}

/// Stop the gateway, then the backend.
pub fn down(config: &ResolvedConfig) -> Result<DownResult> {
    let mut supervisor = supervisor(config)?;
    let report = supervisor.down();
    Ok(DownResult {
        gateway: Step::from_result(report.gateway),
        backend: Step::from_result(report.backend),
    })
}

// === Status ===

#[derive(Serialize)]
pub struct StatusResult {
    pub processes: Vec<ManagedProcess>,
    pub api_url: String,
    pub backend_url: String,
    pub run_dir: PathBuf,
}

impl Output for StatusResult {
    fn to_json(&self) -> String {
        to_json_string(self)
    }

    fn to_human(&self) -> String {
        let mut lines = Vec::new();
        for process in &self.processes {
            let url = match process.kind {
                ProcessKind::Backend => &self.backend_url,
                ProcessKind::Gateway => &self.api_url,
            };
            match process.pid {
                Some(pid) => lines.push(format!(
                    "{:<8} {:<8} PID {:<8} {}",
                    process.kind, process.state, pid, url
                )),
                None => lines.push(format!("{:<8} {}", process.kind, process.state)),
            }
        }
        lines.join("\n")
    }
}

/// Report both processes without changing anything.
pub fn status(config: &ResolvedConfig) -> Result<StatusResult> {
    let supervisor = supervisor(config)?;
    let settings = supervisor.settings();
    Ok(StatusResult {
        processes: supervisor.status(),
        api_url: settings.gateway.base_url(),
        backend_url: settings.backend.base_url(),
        run_dir: settings.run_dir.clone(),
    })
}

// === Config ===

pub struct ConfigShowResult {
    pub resolved: Value,
}

impl Output for ConfigShowResult {
    fn to_json(&self) -> String {
        self.resolved.to_string()
    }

    fn to_human(&self) -> String {
        let mut lines = vec![
            format!("Data dir: {}", json_display(&self.resolved["data-dir"])),
            format!("Config file: {}", json_display(&self.resolved["config-file"])),
            String::new(),
        ];
        if let Some(settings) = self.resolved["settings"].as_object() {
            for (key, entry) in settings {
                lines.push(format!(
                    "{:<22} {:<30} ({})",
                    key,
                    json_display(&entry["value"]),
                    json_display(&entry["source"])
                ));
            }
        }
        lines.join("\n")
    }
}

fn json_display(value: &Value) -> String {
    match value {
        Value::Null => "-".to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(json_display).collect::<Vec<_>>().join(", "),
        other => other.to_string(),
    }
}

/// Show the resolved configuration with the source of each value.
pub fn config_show(config: &ResolvedConfig) -> Result<ConfigShowResult> {
    Ok(ConfigShowResult {
        resolved: config.to_json(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigOverrides, resolve_config};
    use crate::supervisor::ProcessState;
    use tempfile::TempDir;

    fn resolved(dir: &TempDir) -> ResolvedConfig {
        resolve_config(dir.path(), None, &ConfigOverrides::default()).unwrap()
    }

    #[test]
    fn test_status_with_nothing_recorded() {
        let dir = TempDir::new().unwrap();

        let result = status(&resolved(&dir)).unwrap();

        assert_eq!(result.processes.len(), 2);
        assert!(
            result
                .processes
                .iter()
                .all(|p| p.state == ProcessState::Stopped && p.pid.is_none())
        );
        assert_eq!(result.api_url, "http://127.0.0.1:8090");
        let json: Value = serde_json::from_str(&result.to_json()).unwrap();
        assert_eq!(json["processes"][0]["kind"], "backend");
        assert_eq!(json["processes"][1]["state"], "stopped");
    }

    #[test]
    fn test_stop_result_json_is_flat() {
        let result = StopResult {
            kind: ProcessKind::Backend,
            outcome: StopOutcome::Terminated { pid: 42 },
        };
        let json: Value = serde_json::from_str(&result.to_json()).unwrap();
        assert_eq!(json["kind"], "backend");
        assert_eq!(json["method"], "terminated");
        assert_eq!(json["pid"], 42);
        assert_eq!(result.to_human(), "Stopped backend (PID 42)");
    }

    #[test]
    fn test_failed_step_serializes_error() {
        let result = DownResult {
            gateway: Step::Done(StopOutcome::NotRunning),
            backend: Step::Failed {
                error: "Could not terminate PID 7".to_string(),
            },
        };
        assert!(!result.is_success());
        let json: Value = serde_json::from_str(&result.to_json()).unwrap();
        assert_eq!(json["gateway"]["method"], "not_running");
        assert_eq!(json["backend"]["error"], "Could not terminate PID 7");
    }

    #[test]
    fn test_config_show_human_lists_sources() {
        let dir = TempDir::new().unwrap();

        let human = config_show(&resolved(&dir)).unwrap().to_human();

        assert!(human.contains("api-port"));
        assert!(human.contains("(default)"));
        assert!(human.contains("backend-url"));
        assert!(human.contains("(unset)"));
    }

    #[test]
    fn test_claim_pid_file_replaces_stale_entry() {
        let dir = TempDir::new().unwrap();
        let pid_file = PidFile::new(dir.path(), "gateway");
        pid_file.write(i32::MAX as u32 - 1).unwrap();

        assert!(claim_pid_file(&pid_file, std::process::id()).unwrap());
        assert_eq!(pid_file.read().unwrap(), Some(std::process::id()));
    }
}
