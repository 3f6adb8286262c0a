//! Precedence resolution for configuration.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. CLI flags, or the environment variable bound to the flag
//! 2. config.kdl (`--config`, else `<data_dir>/config.kdl`)
//! 3. Built-in defaults

use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::schema::{
    CONFIG_FILE_NAME, ThinknodeConfig, check_port, check_positive, check_temperature,
};
use crate::inference::InferenceSettings;
use crate::supervisor::{BackendLaunch, GatewayLaunch, SupervisorSettings};
use crate::{Error, Result};

pub const DEFAULT_API_HOST: &str = "127.0.0.1";
pub const DEFAULT_API_PORT: u16 = 8090;
pub const DEFAULT_BACKEND_HOST: &str = "127.0.0.1";
pub const DEFAULT_BACKEND_PORT: u16 = 8081;
pub const DEFAULT_BACKEND_BIN: &str = "llama-server";
pub const DEFAULT_THREADS: u32 = 4;
pub const DEFAULT_CTX_SIZE: u32 = 4096;
pub const DEFAULT_HEALTH_RETRIES: u32 = 10;
pub const DEFAULT_HEALTH_DELAY_MS: u64 = 1000;
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Tracks where a resolved value came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueSource {
    /// CLI flag or the environment variable bound to it
    CliFlag,
    /// config.kdl at this path
    ConfigFile(PathBuf),
    /// Built-in default value
    Default,
}

impl std::fmt::Display for ValueSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueSource::CliFlag => write!(f, "cli"),
            ValueSource::ConfigFile(path) => write!(f, "config:{}", path.display()),
            ValueSource::Default => write!(f, "default"),
        }
    }
}

/// A resolved value with its source.
#[derive(Debug, Clone)]
pub struct Resolved<T> {
    pub value: T,
    pub source: ValueSource,
}

impl<T> Resolved<T> {
    pub fn new(value: T, source: ValueSource) -> Self {
        Self { value, source }
    }
}

/// CLI overrides for configuration resolution.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub api_host: Option<String>,
    pub api_port: Option<u16>,
    pub backend_url: Option<String>,
    pub backend_host: Option<String>,
    pub backend_port: Option<u16>,
    pub backend_bin: Option<String>,
    pub model_path: Option<PathBuf>,
    pub model_dirs: Option<Vec<PathBuf>>,
    pub threads: Option<u32>,
    pub ctx_size: Option<u32>,
    pub llm_model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub system_prompt: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub health_retries: Option<u32>,
    pub health_delay_ms: Option<u64>,
}

/// Fully resolved configuration with source tracking.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub data_dir: PathBuf,
    /// The config file consulted (it may not exist)
    pub config_path: PathBuf,
    /// Whether `config_path` was given explicitly
    pub config_explicit: bool,

    pub api_host: Resolved<String>,
    pub api_port: Resolved<u16>,
    pub backend_url: Option<Resolved<String>>,
    pub backend_host: Resolved<String>,
    pub backend_port: Resolved<u16>,
    pub backend_bin: Resolved<String>,
    pub model_path: Option<Resolved<PathBuf>>,
    pub model_dirs: Resolved<Vec<PathBuf>>,
    pub threads: Resolved<u32>,
    pub ctx_size: Resolved<u32>,
    pub llm_model: Resolved<String>,
    pub max_tokens: Resolved<u32>,
    pub temperature: Resolved<f32>,
    pub system_prompt: Option<Resolved<String>>,
    pub request_timeout_secs: Resolved<u64>,
    pub health_retries: Resolved<u32>,
    pub health_delay_ms: Resolved<u64>,
}

/// Model directories searched when none are configured.
pub fn default_model_dirs(data_dir: &Path) -> Vec<PathBuf> {
    vec![data_dir.join("models"), PathBuf::from("models")]
}

fn pick<T>(cli: Option<T>, file: Option<T>, file_source: &ValueSource, default: T) -> Resolved<T> {
    pick_optional(cli, file, file_source).unwrap_or_else(|| Resolved::new(default, ValueSource::Default))
}

fn pick_optional<T>(cli: Option<T>, file: Option<T>, file_source: &ValueSource) -> Option<Resolved<T>> {
    match (cli, file) {
        (Some(v), _) => Some(Resolved::new(v, ValueSource::CliFlag)),
        (None, Some(v)) => Some(Resolved::new(v, file_source.clone())),
        (None, None) => None,
    }
}

/// Blank strings count as unset.
fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// Resolve configuration with the full precedence chain.
///
/// An explicit `config_path` must exist; the default one may be absent.
pub fn resolve_config(
    data_dir: &Path,
    config_path: Option<&Path>,
    overrides: &ConfigOverrides,
) -> Result<ResolvedConfig> {
    let (path, explicit) = match config_path {
        Some(path) => {
            if !path.is_file() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            (path.to_path_buf(), true)
        }
        None => (data_dir.join(CONFIG_FILE_NAME), false),
    };

    let file = ThinknodeConfig::load(&path)?;
    let src = ValueSource::ConfigFile(path.clone());
    let o = overrides.clone();

    let file_model_dirs = if file.model_dirs.is_empty() {
        None
    } else {
        Some(file.model_dirs)
    };

    let resolved = ResolvedConfig {
        data_dir: data_dir.to_path_buf(),
        config_path: path,
        config_explicit: explicit,
        api_host: pick(o.api_host, file.api_host, &src, DEFAULT_API_HOST.to_string()),
        api_port: pick(o.api_port, file.api_port, &src, DEFAULT_API_PORT),
        backend_url: pick_optional(non_blank(o.backend_url), non_blank(file.backend_url), &src),
        backend_host: pick(
            o.backend_host,
            file.backend_host,
            &src,
            DEFAULT_BACKEND_HOST.to_string(),
        ),
        backend_port: pick(o.backend_port, file.backend_port, &src, DEFAULT_BACKEND_PORT),
        backend_bin: pick(
            o.backend_bin,
            file.backend_bin,
            &src,
            DEFAULT_BACKEND_BIN.to_string(),
        ),
        model_path: pick_optional(o.model_path, file.model_path, &src),
        model_dirs: pick(
            o.model_dirs.filter(|dirs| !dirs.is_empty()),
            file_model_dirs,
            &src,
            default_model_dirs(data_dir),
        ),
        threads: pick(o.threads, file.threads, &src, DEFAULT_THREADS),
        ctx_size: pick(o.ctx_size, file.ctx_size, &src, DEFAULT_CTX_SIZE),
        llm_model: pick(
            o.llm_model,
            file.llm_model,
            &src,
            InferenceSettings::default().model,
        ),
        max_tokens: pick(
            o.max_tokens,
            file.max_tokens,
            &src,
            InferenceSettings::default().max_tokens,
        ),
        temperature: pick(
            o.temperature,
            file.temperature,
            &src,
            InferenceSettings::default().temperature,
        ),
        system_prompt: pick_optional(non_blank(o.system_prompt), non_blank(file.system_prompt), &src),
        request_timeout_secs: pick(
            o.request_timeout_secs,
            file.request_timeout_secs,
            &src,
            InferenceSettings::default().timeout.as_secs(),
        ),
        health_retries: pick(o.health_retries, file.health_retries, &src, DEFAULT_HEALTH_RETRIES),
        health_delay_ms: pick(
            o.health_delay_ms,
            file.health_delay_ms,
            &src,
            DEFAULT_HEALTH_DELAY_MS,
        ),
    };
    resolved.validate()?;
    Ok(resolved)
}

/// Attach the value's source to a failed range check.
fn checked<T>(r: &Resolved<T>, check: std::result::Result<(), String>) -> Result<()> {
    check.map_err(|e| Error::Config(format!("{} (from {})", e, r.source)))
}

impl ResolvedConfig {
    /// Range checks on the merged values, so flags and environment variables
    /// are held to the same bounds as config.kdl.
    pub fn validate(&self) -> Result<()> {
        checked(&self.api_port, check_port("api-port", Some(self.api_port.value)))?;
        checked(
            &self.backend_port,
            check_port("backend-port", Some(self.backend_port.value)),
        )?;
        for (key, r) in [
            ("threads", &self.threads),
            ("ctx-size", &self.ctx_size),
            ("max-tokens", &self.max_tokens),
            ("health-retries", &self.health_retries),
        ] {
            checked(r, check_positive(key, Some(u64::from(r.value))))?;
        }
        checked(
            &self.request_timeout_secs,
            check_positive("request-timeout-secs", Some(self.request_timeout_secs.value)),
        )?;
        checked(&self.temperature, check_temperature(Some(self.temperature.value)))
    }

    pub fn backend_url(&self) -> Option<&str> {
        self.backend_url.as_ref().map(|r| r.value.as_str())
    }

    /// Directory for PID files and process logs.
    pub fn run_dir(&self) -> PathBuf {
        self.data_dir.join("run")
    }

    /// Directory for the rolling application log.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn inference_settings(&self) -> InferenceSettings {
        InferenceSettings {
            backend_url: self.backend_url.as_ref().map(|r| r.value.clone()),
            model: self.llm_model.value.clone(),
            max_tokens: self.max_tokens.value,
            temperature: self.temperature.value,
            system_prompt: self.system_prompt.as_ref().map(|r| r.value.clone()),
            timeout: Duration::from_secs(self.request_timeout_secs.value),
            ..InferenceSettings::default()
        }
    }

    /// Supervisor settings; `exe` is the binary launched as the gateway.
    pub fn supervisor_settings(&self, exe: PathBuf) -> SupervisorSettings {
        SupervisorSettings {
            run_dir: self.run_dir(),
            backend: BackendLaunch {
                program: self.backend_bin.value.clone(),
                host: self.backend_host.value.clone(),
                port: self.backend_port.value,
                model_path: self.model_path.as_ref().map(|r| r.value.clone()),
                model_dirs: self.model_dirs.value.clone(),
                threads: self.threads.value,
                ctx_size: self.ctx_size.value,
            },
            gateway: GatewayLaunch {
                program: exe,
                host: self.api_host.value.clone(),
                port: self.api_port.value,
                data_dir: self.data_dir.clone(),
                config_path: self.config_explicit.then(|| self.config_path.clone()),
                backend_url: self.backend_url.as_ref().map(|r| r.value.clone()),
            },
            health_retries: self.health_retries.value,
            health_delay: Duration::from_millis(self.health_delay_ms.value),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    /// Every setting as `{key: {value, source}}`, in config.kdl key names.
    pub fn to_json(&self) -> Value {
        fn entry<T: serde::Serialize>(r: &Resolved<T>) -> Value {
            json!({ "value": r.value, "source": r.source.to_string() })
        }
        fn optional<T: serde::Serialize>(r: &Option<Resolved<T>>) -> Value {
            match r {
                Some(r) => entry(r),
                None => json!({ "value": null, "source": "unset" }),
            }
        }

        json!({
            "data-dir": self.data_dir,
            "config-file": self.config_path,
            "settings": {
                "api-host": entry(&self.api_host),
                "api-port": entry(&self.api_port),
                "backend-url": optional(&self.backend_url),
                "backend-host": entry(&self.backend_host),
                "backend-port": entry(&self.backend_port),
                "backend-bin": entry(&self.backend_bin),
                "model-path": optional(&self.model_path),
                "model-dir": entry(&self.model_dirs),
                "threads": entry(&self.threads),
                "ctx-size": entry(&self.ctx_size),
                "llm-model": entry(&self.llm_model),
                "max-tokens": entry(&self.max_tokens),
                "temperature": entry(&self.temperature),
                "system-prompt": optional(&self.system_prompt),
                "request-timeout-secs": entry(&self.request_timeout_secs),
                "health-retries": entry(&self.health_retries),
                "health-delay-ms": entry(&self.health_delay_ms),
            }
        })
    }
}
