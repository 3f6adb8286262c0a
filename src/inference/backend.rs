//! HTTP client for a llama.cpp-style completion backend.

use super::{InferenceError, InferenceSettings, flatten_prompt};
use crate::Error;
use crate::models::Message;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

/// Client for `POST <base_url>/completion`.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    system_prompt: Option<String>,
    timeout: Duration,
    history_window: usize,
}

/// Request body understood by llama.cpp (`n_predict`) and OpenAI-style
/// servers (`max_tokens`) alike.
#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: String,
    n_predict: u32,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

impl BackendClient {
    pub fn new(base_url: &str, settings: &InferenceSettings) -> crate::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| Error::Other(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
            system_prompt: settings.system_prompt.clone(),
            timeout: settings.timeout,
            history_window: settings.history_window,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn completion_url(&self) -> String {
        format!("{}/completion", self.base_url)
    }

    /// Issue one completion request for the given history.
    pub async fn complete(&self, history: &[Message]) -> Result<String, InferenceError> {
        let url = self.completion_url();
        let request = CompletionRequest {
            model: &self.model,
            prompt: flatten_prompt(self.system_prompt.as_deref(), history, self.history_window),
            n_predict: self.max_tokens,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream: false,
        };

        tracing::info!(url = %url, messages = history.len(), "calling inference backend");

        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.classify(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(InferenceError::Status {
                url,
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(|e| self.classify(&url, e))?;

        // Non-JSON bodies are taken verbatim.
        let text = match serde_json::from_str::<Value>(&body) {
            Ok(raw) => extract_completion_text(&raw),
            Err(_) => Some(body),
        };

        match text.map(|t| t.trim().to_string()) {
            Some(t) if !t.is_empty() => Ok(t),
            _ => Err(InferenceError::EmptyResponse { url }),
        }
    }

    fn classify(&self, url: &str, err: reqwest::Error) -> InferenceError {
        if err.is_timeout() {
            InferenceError::Timeout {
                url: url.to_string(),
                secs: self.timeout.as_secs(),
            }
        } else {
            InferenceError::Unreachable {
                url: url.to_string(),
                reason: err.to_string(),
            }
        }
    }
}

/// Pull the generated text out of a completion response.
///
/// Accepted shapes:
/// - `{"content": "..."}` (llama.cpp)
/// - `{"content": ["...", {"content": "..."}]}` (chunked)
/// - `{"choices": [{"text": "..."}]}` (OpenAI completions)
/// - `{"choices": [{"message": {"content": "..."}}]}` (OpenAI chat)
pub fn extract_completion_text(raw: &Value) -> Option<String> {
    match raw.get("content") {
        Some(Value::String(text)) => return Some(text.clone()),
        Some(Value::Array(parts)) => {
            let joined: String = parts
                .iter()
                .filter_map(|part| match part {
                    Value::String(s) => Some(s.as_str()),
                    Value::Object(_) => part.get("content").and_then(Value::as_str),
                    _ => None,
                })
                .collect();
            return Some(joined);
        }
        _ => {}
    }

    let choice = raw.get("choices")?.as_array()?.first()?;
    if let Some(text) = choice.get("text").and_then(Value::as_str) {
        return Some(text.to_string());
    }
    choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
}
