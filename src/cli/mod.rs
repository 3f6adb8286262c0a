//! CLI argument definitions for thinknode.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::ConfigOverrides;
use crate::supervisor::ProcessKind;

/// thinknode - a graph of thinking nodes with persistent chat and logs.
///
/// Run `tn up` to start the inference backend and the API together, or
/// `tn serve` to run the API alone in the foreground.
#[derive(Parser, Debug)]
#[command(name = "tn")]
#[command(author, version, about = "A graph of thinking nodes with persistent chat, logs and a local inference backend", long_about = None)]
pub struct Cli {
    /// Output in human-readable format instead of JSON
    #[arg(short = 'H', long = "human", global = true)]
    pub human_readable: bool,

    /// Data directory holding the store, config.kdl, PID files and logs
    #[arg(long, global = true, env = "TN_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Config file to use instead of <data-dir>/config.kdl
    #[arg(long, global = true, env = "TN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit log lines as JSON
    #[arg(long, global = true, env = "TN_LOG_JSON")]
    pub log_json: bool,

    #[command(flatten)]
    pub settings: SettingsArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Settings that override config.kdl.
#[derive(Args, Debug, Clone, Default)]
#[command(next_help_heading = "Settings")]
pub struct SettingsArgs {
    /// Host the API binds to
    #[arg(long, global = true, env = "TN_API_HOST")]
    pub api_host: Option<String>,

    /// Port the API binds to
    #[arg(long, global = true, env = "TN_API_PORT")]
    pub api_port: Option<u16>,

    /// Base URL of the completion backend; unset means mock replies only
    #[arg(long, global = true, env = "TN_BACKEND_URL")]
    pub backend_url: Option<String>,

    /// Host the managed backend binds to
    #[arg(long, global = true)]
    pub backend_host: Option<String>,

    /// Port the managed backend binds to
    #[arg(long, global = true)]
    pub backend_port: Option<u16>,

    /// Backend executable (name on PATH or full path)
    #[arg(long, global = true, env = "TN_BACKEND_BIN")]
    pub backend_bin: Option<String>,

    /// Model file for the backend
    #[arg(long, global = true, env = "TN_MODEL_PATH")]
    pub model_path: Option<PathBuf>,

    /// Directories searched for a model (comma-separated)
    #[arg(long = "model-dir", global = true, env = "TN_MODEL_DIR", value_delimiter = ',')]
    pub model_dirs: Vec<PathBuf>,

    /// Backend thread count
    #[arg(long, global = true)]
    pub threads: Option<u32>,

    /// Backend context size
    #[arg(long, global = true)]
    pub ctx_size: Option<u32>,

    /// Model name sent with completion requests
    #[arg(long, global = true)]
    pub llm_model: Option<String>,

    /// Maximum tokens per reply
    #[arg(long, global = true)]
    pub max_tokens: Option<u32>,

    /// Sampling temperature
    #[arg(long, global = true)]
    pub temperature: Option<f32>,

    /// Guidance line prepended to every prompt
    #[arg(long, global = true)]
    pub system_prompt: Option<String>,

    /// Timeout for one completion request, in seconds
    #[arg(long, global = true)]
    pub request_timeout_secs: Option<u64>,

    /// Readiness probes after launching a process
    #[arg(long, global = true)]
    pub health_retries: Option<u32>,

    /// Delay between readiness probes, in milliseconds
    #[arg(long, global = true)]
    pub health_delay_ms: Option<u64>,
}

impl SettingsArgs {
    pub fn to_overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            api_host: self.api_host.clone(),
            api_port: self.api_port,
            backend_url: self.backend_url.clone(),
            backend_host: self.backend_host.clone(),
            backend_port: self.backend_port,
            backend_bin: self.backend_bin.clone(),
            model_path: self.model_path.clone(),
            model_dirs: if self.model_dirs.is_empty() {
                None
            } else {
                Some(self.model_dirs.clone())
            },
            threads: self.threads,
            ctx_size: self.ctx_size,
            llm_model: self.llm_model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            system_prompt: self.system_prompt.clone(),
            request_timeout_secs: self.request_timeout_secs,
            health_retries: self.health_retries,
            health_delay_ms: self.health_delay_ms,
        }
    }
}

/// Top-level commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the REST API in the foreground
    Serve,

    /// Start the inference backend, then the API
    ///
    /// A backend that cannot start is reported; the API still starts and
    /// answers with mock replies.
    Up,

    /// Stop the API, then the inference backend
    Down,

    /// Start one managed process
    Start {
        #[arg(value_enum)]
        target: ProcessKind,
    },

    /// Stop one managed process (SIGTERM, then SIGKILL after a grace period)
    Stop {
        #[arg(value_enum)]
        target: ProcessKind,
    },

    /// Show state and PID of the managed processes
    Status,

    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show the resolved configuration and where each value came from
    Show,
}
