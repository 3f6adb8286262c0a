//! KDL schema for config.kdl.
//!
//! ```kdl
//! // Gateway
//! api-host "127.0.0.1"
//! api-port 8090
//!
//! // Inference backend
//! backend-url "http://127.0.0.1:8081"
//! backend-bin "/opt/llama.cpp/llama-server"
//! model-dir "/srv/models" "~/models"
//! threads 8
//! ctx-size 8192
//!
//! // Completion requests
//! llm-model "local-7b"
//! temperature 0.4
//! system-prompt "Think in small steps"
//! ```
//!
//! Unknown nodes are ignored. A value of the wrong type is skipped with a
//! warning; out-of-range values are rejected by [`ThinknodeConfig::validate`].

use kdl::{KdlDocument, KdlValue};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// File name of the configuration inside the data directory.
pub const CONFIG_FILE_NAME: &str = "config.kdl";

/// Settings read from config.kdl. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ThinknodeConfig {
    pub api_host: Option<String>,
    pub api_port: Option<u16>,

    pub backend_url: Option<String>,
    pub backend_host: Option<String>,
    pub backend_port: Option<u16>,
    pub backend_bin: Option<String>,

    pub model_path: Option<PathBuf>,
    /// All `model-dir` entries, in file order
    pub model_dirs: Vec<PathBuf>,
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

impl ThinknodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and validate a config file. A missing file yields an empty config.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e.into()),
        };
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parse and validate KDL text.
    pub fn parse(content: &str) -> std::result::Result<Self, String> {
        let doc: KdlDocument = content.parse().map_err(|e| format!("invalid KDL: {}", e))?;
        let config = Self::from_kdl(&doc);
        config.validate()?;
        Ok(config)
    }

    /// Parse config from a KDL document.
    pub fn from_kdl(doc: &KdlDocument) -> Self {
        Self {
            api_host: string_value(doc, "api-host"),
            api_port: integer_value(doc, "api-port"),
            backend_url: string_value(doc, "backend-url"),
            backend_host: string_value(doc, "backend-host"),
            backend_port: integer_value(doc, "backend-port"),
            backend_bin: string_value(doc, "backend-bin"),
            model_path: string_value(doc, "model-path").map(PathBuf::from),
            model_dirs: doc
                .nodes()
                .iter()
                .filter(|node| node.name().value() == "model-dir")
                .flat_map(|node| node.entries())
                .filter_map(|entry| entry.value().as_string())
                .map(PathBuf::from)
                .collect(),
            threads: integer_value(doc, "threads"),
            ctx_size: integer_value(doc, "ctx-size"),
            llm_model: string_value(doc, "llm-model"),
            max_tokens: integer_value(doc, "max-tokens"),
            temperature: float_value(doc, "temperature"),
            system_prompt: string_value(doc, "system-prompt"),
            request_timeout_secs: integer_value(doc, "request-timeout-secs"),
            health_retries: integer_value(doc, "health-retries"),
            health_delay_ms: integer_value(doc, "health-delay-ms"),
        }
    }

    /// Validate value ranges.
    pub fn validate(&self) -> std::result::Result<(), String> {
        check_port("api-port", self.api_port)?;
        check_port("backend-port", self.backend_port)?;
        check_positive("threads", self.threads.map(u64::from))?;
        check_positive("ctx-size", self.ctx_size.map(u64::from))?;
        check_positive("max-tokens", self.max_tokens.map(u64::from))?;
        check_positive("health-retries", self.health_retries.map(u64::from))?;
        check_positive("request-timeout-secs", self.request_timeout_secs)?;
        check_temperature(self.temperature)
    }
}

/// Range checks shared by config.kdl values and their CLI overrides.
pub(crate) fn check_port(key: &str, port: Option<u16>) -> std::result::Result<(), String> {
    match port {
        Some(0) => Err(format!("{} must be between 1 and 65535", key)),
        _ => Ok(()),
    }
}

pub(crate) fn check_positive(key: &str, value: Option<u64>) -> std::result::Result<(), String> {
    match value {
        Some(0) => Err(format!("{} must be greater than 0", key)),
        _ => Ok(()),
    }
}

pub(crate) fn check_temperature(value: Option<f32>) -> std::result::Result<(), String> {
    match value {
        Some(t) if !(0.0..=2.0).contains(&t) => Err(format!(
            "temperature must be between 0.0 and 2.0, got {}",
            t
        )),
        _ => Ok(()),
    }
}

fn first_value<'a>(doc: &'a KdlDocument, key: &str) -> Option<&'a KdlValue> {
    doc.get(key)?.entries().first().map(|entry| entry.value())
}

fn string_value(doc: &KdlDocument, key: &str) -> Option<String> {
    let value = first_value(doc, key)?;
    match value.as_string() {
        Some(s) => Some(s.to_string()),
        None => {
            tracing::warn!(key, "expected a string in config.kdl, ignoring");
            None
        }
    }
}

fn integer_value<T: TryFrom<i128>>(doc: &KdlDocument, key: &str) -> Option<T> {
    let value = first_value(doc, key)?;
    match value.as_integer().and_then(|i| T::try_from(i).ok()) {
        Some(v) => Some(v),
        None => {
            tracing::warn!(key, "expected a non-negative integer in config.kdl, ignoring");
            None
        }
    }
}

fn float_value(doc: &KdlDocument, key: &str) -> Option<f32> {
    let value = first_value(doc, key)?;
    match (value.as_float(), value.as_integer()) {
        (Some(f), _) => Some(f as f32),
        (None, Some(i)) => Some(i as f32),
        _ => {
            tracing::warn!(key, "expected a number in config.kdl, ignoring");
            None
        }
    }
}
