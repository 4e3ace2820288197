//! Model endpoint configuration.
//!
//! The `model:` section of `mcp-agent.yaml`. Defaults target a local
//! Ollama server through its OpenAI-compatible `/v1` API, honouring
//! `OLLAMA_BASE_URL` and `OLLAMA_MODEL`.

use std::time::Duration;

use serde::Deserialize;

use super::errors::InferenceError;

// ─── Defaults ────────────────────────────────────────────────────────────────

const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "qwen3:30b-a3b";
const DEFAULT_TEMPERATURE: f32 = 0.1;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 180;

fn default_base_url() -> String {
    std::env::var("OLLAMA_BASE_URL").unwrap_or_else(|_| DEFAULT_OLLAMA_BASE_URL.to_string())
}

fn default_model_name() -> String {
    std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string())
}

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

// ─── ModelConfig ─────────────────────────────────────────────────────────────

/// Reasoning engine endpoint and sampling settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Server root or `/v1` API root. `/v1` is appended when missing.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Bearer token for hosted OpenAI-compatible endpoints.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Models tried in order when the primary one is unavailable.
    #[serde(default)]
    pub fallback_models: Vec<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model_name: default_model_name(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            api_key: None,
            fallback_models: Vec::new(),
        }
    }
}

impl ModelConfig {
    /// API root ending in `/v1`, without a trailing slash.
    pub fn api_base(&self) -> String {
        let trimmed = self.base_url.trim_end_matches('/');
        if trimmed.ends_with("/v1") {
            trimmed.to_string()
        } else {
            format!("{trimmed}/v1")
        }
    }

    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_base())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Primary model followed by the fallbacks, without duplicates.
    pub fn model_chain(&self) -> Vec<String> {
        let mut chain = vec![self.model_name.clone()];
        for model in &self.fallback_models {
            if !chain.contains(model) {
                chain.push(model.clone());
            }
        }
        chain
    }

    pub fn validate(&self) -> Result<(), InferenceError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(InferenceError::ConfigError {
                reason: format!("model.base_url must be an http(s) URL, got '{}'", self.base_url),
            });
        }
        if self.model_name.trim().is_empty() {
            return Err(InferenceError::ConfigError {
                reason: "model.model_name is empty".into(),
            });
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(InferenceError::ConfigError {
                reason: format!("model.temperature must be within 0.0..=2.0, got {}", self.temperature),
            });
        }
        if self.request_timeout_secs == 0 {
            return Err(InferenceError::ConfigError {
                reason: "model.request_timeout_secs must be positive".into(),
            });
        }
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
