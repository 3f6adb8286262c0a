//! Inference adapter: turns a node's chat history into an assistant reply.
//!
//! The adapter is a tagged variant chosen once at startup:
//! - [`InferenceAdapter::Mock`] synthesises a templated reply locally
//! - [`InferenceAdapter::Backend`] calls a completion endpoint over HTTP and
//!   falls back to the mock reply whenever that call fails
//!
//! The adapter never returns an error. A failed backend call is reported in
//! [`Completion::failure`] so the caller can record it against the node.

mod backend;

pub use backend::{BackendClient, extract_completion_text};

use crate::models::{Message, Node, Role};
use std::time::Duration;

/// Guidance line used when no system prompt is configured.
pub const DEFAULT_GUIDANCE: &str = "Seed AI reasoning node";

/// Number of trailing messages the mock scans for the latest user note.
const MOCK_RECENT_WINDOW: usize = 4;

/// Settings for building an adapter.
#[derive(Debug, Clone)]
pub struct InferenceSettings {
    /// Base URL of the completion backend; `None` selects the mock
    pub backend_url: Option<String>,
    /// Model name forwarded to the backend
    pub model: String,
    /// Upper bound on generated tokens
    pub max_tokens: u32,
    pub temperature: f32,
    pub system_prompt: Option<String>,
    /// Timeout for a single backend call
    pub timeout: Duration,
    /// How many trailing messages are flattened into the prompt
    pub history_window: usize,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            backend_url: None,
            model: "local-7b".to_string(),
            max_tokens: 256,
            temperature: 0.7,
            system_prompt: None,
            timeout: Duration::from_secs(20),
            history_window: 20,
        }
    }
}

/// Why a backend call did not produce a reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InferenceError {
    #[error("inference backend unreachable at {url}: {reason}")]
    Unreachable { url: String, reason: String },

    #[error("inference backend at {url} timed out after {secs}s")]
    Timeout { url: String, secs: u64 },

    #[error("inference backend at {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("inference backend at {url} returned no usable text")]
    EmptyResponse { url: String },
}

/// Where a reply came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplySource {
    Mock,
    Backend,
    /// The backend failed and the mock answered instead
    Fallback,
}

/// Result of one adapter call.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub source: ReplySource,
    pub failure: Option<InferenceError>,
}

/// Deterministic reply generator used without (or instead of) a backend.
#[derive(Debug, Clone, Default)]
pub struct MockResponder {
    system_prompt: Option<String>,
}

impl MockResponder {
    pub fn new(system_prompt: Option<String>) -> Self {
        Self { system_prompt }
    }

    /// Build the templated reply for a node and its history.
    pub fn reply(&self, node: &Node, history: &[Message]) -> String {
        let start = history.len().saturating_sub(MOCK_RECENT_WINDOW);
        let latest_user = history[start..]
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.body.as_str())
            .unwrap_or_default();
        let guidance = self.system_prompt.as_deref().unwrap_or(DEFAULT_GUIDANCE);

        format!(
            "[{}] {}: Received {} messages. Latest user note: {}",
            node.title,
            guidance,
            history.len(),
            latest_user
        )
        .trim()
        .to_string()
    }
}

/// The inference adapter injected into the node service.
#[derive(Debug, Clone)]
pub enum InferenceAdapter {
    Mock(MockResponder),
    Backend {
        client: BackendClient,
        fallback: MockResponder,
    },
}

impl InferenceAdapter {
    /// Mock-only adapter.
    pub fn mock(system_prompt: Option<String>) -> Self {
        InferenceAdapter::Mock(MockResponder::new(system_prompt))
    }

    /// Pick the variant from settings: a backend URL selects the HTTP client.
    pub fn from_settings(settings: &InferenceSettings) -> crate::Result<Self> {
        let fallback = MockResponder::new(settings.system_prompt.clone());
        match settings.backend_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => Ok(InferenceAdapter::Backend {
                client: BackendClient::new(url, settings)?,
                fallback,
            }),
            _ => Ok(InferenceAdapter::Mock(fallback)),
        }
    }

    /// Short name of the variant ("mock" or "backend").
    pub fn kind(&self) -> &'static str {
        match self {
            InferenceAdapter::Mock(_) => "mock",
            InferenceAdapter::Backend { .. } => "backend",
        }
    }

    /// Base URL of the backend, if any.
    pub fn backend_url(&self) -> Option<&str> {
        match self {
            InferenceAdapter::Mock(_) => None,
            InferenceAdapter::Backend { client, .. } => Some(client.base_url()),
        }
    }

    /// Produce a reply for the node given its full history (latest user
    /// message included). Never fails.
    pub async fn complete(&self, node: &Node, history: &[Message]) -> Completion {
        match self {
            InferenceAdapter::Mock(mock) => Completion {
                text: mock.reply(node, history),
                source: ReplySource::Mock,
                failure: None,
            },
            InferenceAdapter::Backend { client, fallback } => {
                match client.complete(history).await {
                    Ok(text) => Completion {
                        text,
                        source: ReplySource::Backend,
                        failure: None,
                    },
                    Err(err) => {
                        tracing::warn!(node = %node.hash, error = %err, "inference backend failed, using mock reply");
                        Completion {
                            text: fallback.reply(node, history),
                            source: ReplySource::Fallback,
                            failure: Some(err),
                        }
                    }
                }
            }
        }
    }
}

/// Flatten a chat history into a single completion prompt.
///
/// Only the last `window` messages are kept; the prompt ends with an open
/// `Assistant:` turn for the model to fill.
pub fn flatten_prompt(system_prompt: Option<&str>, history: &[Message], window: usize) -> String {
    let start = history.len().saturating_sub(window);
    let mut prompt = String::new();
    prompt.push_str(system_prompt.unwrap_or(DEFAULT_GUIDANCE));
    prompt.push_str("\n\n");
    for message in &history[start..] {
        let speaker = match message.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
        };
        prompt.push_str(&format!("{}: {}\n", speaker, message.body));
    }
    prompt.push_str("Assistant:");
    prompt
}
