//! OpenAI-compatible inference client.
//!
//! Sends chat completion requests to the model endpoint and turns each
//! reply into an `EngineDecision`. Handles the fallback chain when the
//! primary model is unavailable.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;

use crate::agent_core::engine::{EngineDecision, ReasoningEngine};
use crate::agent_core::session::Session;
use crate::agent_core::types::TranscriptEntry;
use crate::mcp_client::registry::CatalogSnapshot;

use super::config::ModelConfig;
use super::errors::InferenceError;
use super::response::parse_chat_response;
use super::types::{ChatCompletionRequest, ChatMessage, ModelReply};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default system prompt.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. \
Always reply in the same language the user writes in. \
Answer the user's question accurately and concisely. \
Use the available tools whenever you need information you do not already have, \
and base your answer on what the tools return.";

// ─── InferenceClient ─────────────────────────────────────────────────────────

/// Client for the model endpoint.
///
/// The fallback position is sticky: once a model fails over, later
/// requests start from the model that last worked.
pub struct InferenceClient {
    http: HttpClient,
    config: ModelConfig,
    /// Primary model followed by the fallbacks.
    chain: Vec<String>,
    /// Index into `chain` of the model currently in use.
    active: AtomicUsize,
    system_prompt: String,
    /// Cap on each observation fed back to the model.
    max_observation_chars: usize,
}

impl InferenceClient {
    /// Create a client. Does NOT check connectivity; that happens on the
    /// first request.
    pub fn from_config(
        config: ModelConfig,
        system_prompt: impl Into<String>,
        max_observation_chars: usize,
    ) -> Result<Self, InferenceError> {
        config.validate()?;

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: config.api_base(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            chain: config.model_chain(),
            config,
            active: AtomicUsize::new(0),
            system_prompt: system_prompt.into(),
            max_observation_chars,
        })
    }

    pub fn base_url(&self) -> String {
        self.config.api_base()
    }

    /// Name of the model requests currently go to.
    pub fn current_model_name(&self) -> &str {
        let idx = self.active.load(Ordering::Relaxed).min(self.chain.len() - 1);
        &self.chain[idx]
    }

    // ─── Chat Completion ─────────────────────────────────────────────────

    /// Send a chat completion, walking the fallback chain on retriable
    /// failures.
    pub async fn chat_completion(
        &self,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<serde_json::Value>>,
    ) -> Result<ModelReply, InferenceError> {
        let start = self.active.load(Ordering::Relaxed).min(self.chain.len() - 1);
        let mut attempted = Vec::new();

        for (idx, model) in self.chain.iter().enumerate().skip(start) {
            match self.send(model, messages.clone(), tools.clone()).await {
                Ok(reply) => {
                    if idx != start {
                        self.active.store(idx, Ordering::Relaxed);
                        tracing::warn!(model = %model, "switched to fallback model");
                    }
                    return Ok(reply);
                }
                Err(e) if e.is_retriable() => {
                    tracing::warn!(model = %model, error = %e, "model unavailable, trying next in chain");
                    attempted.push(model.clone());
                }
                Err(e) => return Err(e),
            }
        }

        Err(InferenceError::AllModelsUnavailable { attempted })
    }

    async fn send(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<serde_json::Value>>,
    ) -> Result<ModelReply, InferenceError> {
        let url = self.config.chat_completions_url();
        let body = ChatCompletionRequest {
            model: model.to_string(),
            messages,
            tool_choice: tools.as_ref().map(|_| "auto".to_string()),
            tools,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            stream: false,
        };

        let mut request = self.http.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    duration_secs: self.config.request_timeout_secs,
                }
            } else {
                InferenceError::ConnectionFailed {
                    endpoint: url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let body_text = response.text().await.map_err(|e| InferenceError::ResponseError {
            reason: format!("failed to read response body: {e}"),
        })?;

        parse_chat_response(&body_text)
    }

    // ─── Message Building ────────────────────────────────────────────────

    /// Render the session as a chat transcript.
    ///
    /// System prompt and tool summary first, then prior exchanges of the
    /// conversation, then this session's prompt, actions and observations.
    pub fn build_messages(&self, session: &Session, catalog: &CatalogSnapshot) -> Vec<ChatMessage> {
        let mut system = self.system_prompt.clone();
        if !catalog.is_empty() {
            system.push_str("\n\n");
            system.push_str(&catalog.capability_summary());
        }

        let mut messages = vec![ChatMessage::system(&system)];
        for exchange in session.history() {
            messages.push(ChatMessage::user(&exchange.prompt));
            messages.push(ChatMessage::assistant(&exchange.answer));
        }

        for entry in session.transcript() {
            match entry {
                TranscriptEntry::Prompt { text } => messages.push(ChatMessage::user(text)),
                TranscriptEntry::Action { requests, .. } => {
                    messages.push(ChatMessage::assistant_tool_calls(requests));
                }
                TranscriptEntry::Observation { result, .. } => {
                    let text = result.observation_text(self.max_observation_chars);
                    messages.push(ChatMessage::tool_result(&result.call_id, &text));
                }
                TranscriptEntry::FinalAnswer { text } => messages.push(ChatMessage::assistant(text)),
            }
        }
        messages
    }
}

#[async_trait]
impl ReasoningEngine for InferenceClient {
    async fn decide(
        &self,
        session: &Session,
        catalog: &CatalogSnapshot,
    ) -> Result<EngineDecision, InferenceError> {
        let messages = self.build_messages(session, catalog);
        let tools = if catalog.is_empty() {
            None
        } else {
            Some(catalog.to_openai_tools())
        };

        tracing::debug!(
            model = %self.current_model_name(),
            messages = messages.len(),
            tools = catalog.len(),
            step = session.step_count(),
            "requesting model decision"
        );

        let reply = self.chat_completion(messages, tools).await?;
        if reply.tool_calls.is_empty() {
            Ok(EngineDecision::FinalAnswer(reply.content.unwrap_or_default()))
        } else {
            Ok(EngineDecision::ToolCalls(reply.tool_calls))
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
