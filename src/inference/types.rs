//! Wire types for `/v1/chat/completions`.
//!
//! Only the subset the agent sends: plain text turns, assistant tool-call
//! turns and tool results.

use serde::{Deserialize, Serialize};

use crate::mcp_client::types::ToolCallRequest;

// ─── Request Types ───────────────────────────────────────────────────────────

/// One chat turn.
///
/// `content` always serializes as a string: assistant tool-call turns send
/// `""`, since Ollama and llama.cpp lose the tool round-trip on `null`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(serialize_with = "serialize_content")]
    pub content: Option<String>,
    /// Set on `tool` turns only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Set on assistant tool-call turns only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallResponse>>,
}

impl ChatMessage {
    fn text(role: Role, content: &str) -> Self {
        Self {
            role,
            content: Some(content.to_string()),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn system(content: &str) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: &str) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: &str) -> Self {
        Self::text(Role::Assistant, content)
    }

    /// Assistant turn that requested `requests`.
    pub fn assistant_tool_calls(requests: &[ToolCallRequest]) -> Self {
        let calls = requests
            .iter()
            .map(|r| ToolCallResponse {
                id: r.id.clone(),
                r#type: "function".to_string(),
                function: FunctionCallResponse {
                    name: r.name.clone(),
                    // Unparseable text goes back exactly as the model wrote it.
                    arguments: match &r.arguments {
                        serde_json::Value::String(raw) => raw.clone(),
                        other => other.to_string(),
                    },
                },
            })
            .collect();
        Self {
            role: Role::Assistant,
            content: None,
            tool_call_id: None,
            tool_calls: Some(calls),
        }
    }

    /// Tool result for the call with `tool_call_id`.
    pub fn tool_result(tool_call_id: &str, content: &str) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.to_string()),
            tool_call_id: Some(tool_call_id.to_string()),
            tool_calls: None,
        }
    }
}

fn serialize_content<S>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match value {
        Some(s) => serializer.serialize_str(s),
        None => serializer.serialize_str(""),
    }
}

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Request body for `POST /v1/chat/completions`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Tools in OpenAI function format.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub stream: bool,
}

// ─── Response Types ──────────────────────────────────────────────────────────

/// Tool call in OpenAI function format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResponse {
    pub id: String,
    pub r#type: String,
    pub function: FunctionCallResponse,
}

/// `arguments` is a JSON-encoded string on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCallResponse {
    pub name: String,
    pub arguments: String,
}

/// The parsed assistant turn.
#[derive(Debug, Clone, Default)]
pub struct ModelReply {
    /// Answer text with any reasoning block removed.
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    /// Why the model stopped: `"stop"`, `"tool_calls"`, `"length"`.
    pub finish_reason: Option<String>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────
