//! Chat completion response parsing.
//!
//! Turns a non-streaming `/v1/chat/completions` body into a `ModelReply`.
//! Native tool calls only: `arguments` may arrive as a JSON string (OpenAI)
//! or as an object (some Ollama builds). Argument text that is not valid
//! JSON is kept verbatim as a string, so the call is rejected as an
//! argument error and the model gets to try again. Reasoning models that
//! inline their chain-of-thought in `<think>` tags have it removed from
//! `content`.

use serde::Deserialize;
use uuid::Uuid;

use crate::mcp_client::types::ToolCallRequest;

use super::errors::InferenceError;
use super::types::ModelReply;

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
    /// Separate reasoning channel (Qwen3, GPT-OSS via Ollama). Never shown.
    #[allow(dead_code)]
    reasoning: Option<String>,
    tool_calls: Option<Vec<CompletionToolCall>>,
}

#[derive(Deserialize)]
struct CompletionToolCall {
    id: Option<String>,
    function: CompletionFunction,
}

#[derive(Deserialize)]
struct CompletionFunction {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

/// Parse a chat completion response body.
pub fn parse_chat_response(body: &str) -> Result<ModelReply, InferenceError> {
    let resp: CompletionResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::ResponseError {
            reason: format!("failed to parse chat completion: {e}"),
        })?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or(InferenceError::ResponseError {
            reason: "empty choices array".into(),
        })?;

    let content = choice
        .message
        .content
        .map(|c| strip_think_blocks(&c))
        .filter(|c| !c.is_empty());

    let mut tool_calls = Vec::new();
    for tc in choice.message.tool_calls.unwrap_or_default() {
        let id = tc
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("call_{}", Uuid::new_v4()));
        let arguments = parse_arguments(&tc.function.name, tc.function.arguments);
        tool_calls.push(ToolCallRequest::new(id, tc.function.name, arguments));
    }

    Ok(ModelReply {
        content,
        tool_calls,
        finish_reason: choice.finish_reason,
    })
}

fn parse_arguments(tool: &str, raw: serde_json::Value) -> serde_json::Value {
    match raw {
        serde_json::Value::Null => serde_json::json!({}),
        serde_json::Value::String(s) if s.trim().is_empty() => serde_json::json!({}),
        serde_json::Value::String(s) => match serde_json::from_str(&s) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(tool, error = %e, raw = %s, "tool call arguments are not valid JSON");
                serde_json::Value::String(s)
            }
        },
        other => other,
    }
}

/// Remove `<think>…</think>` spans. An unclosed block swallows the rest.
pub fn strip_think_blocks(text: &str) -> String {
    const OPEN: &str = "<think>";
    const CLOSE: &str = "</think>";

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        match rest[start..].find(CLOSE) {
            Some(end) => rest = &rest[start + end + CLOSE.len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_plain_answer() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"Tokyo"},"finish_reason":"stop"}]}"#;
        let reply = parse_chat_response(body).unwrap();
        assert_eq!(reply.content.as_deref(), Some("Tokyo"));
        assert!(reply.tool_calls.is_empty());
        assert_eq!(reply.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_parse_string_arguments() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": {"name": "web_search", "arguments": "{\"query\":\"rust\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        })
        .to_string();
        let reply = parse_chat_response(&body).unwrap();
        assert!(reply.content.is_none());
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].id, "call_abc");
        assert_eq!(reply.tool_calls[0].arguments, json!({"query": "rust"}));
    }

    #[test]
    fn test_parse_object_arguments_and_missing_id() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{"function": {"name": "db__query", "arguments": {"sql": "select 1"}}}]
                },
                "finish_reason": "tool_calls"
            }]
        })
        .to_string();
        let reply = parse_chat_response(&body).unwrap();
        assert!(reply.tool_calls[0].id.starts_with("call_"));
        assert_eq!(reply.tool_calls[0].arguments, json!({"sql": "select 1"}));
    }

    #[test]
    fn test_invalid_argument_json_is_kept_as_text() {
        let body = json!({
            "choices": [{
                "message": {"tool_calls": [
                    {"id": "c1", "function": {"name": "x", "arguments": "{oops"}},
                    {"id": "c2", "function": {"name": "y", "arguments": "{\"ok\":1}"}}
                ]},
                "finish_reason": "tool_calls"
            }]
        })
        .to_string();
        let reply = parse_chat_response(&body).unwrap();
        assert_eq!(reply.tool_calls.len(), 2);
        assert_eq!(reply.tool_calls[0].arguments, json!("{oops"));
        assert_eq!(reply.tool_calls[1].arguments, json!({"ok": 1}));
    }

    #[test]
    fn test_parse_empty_choices() {
        let err = parse_chat_response(r#"{"choices":[]}"#).unwrap_err();
        assert!(matches!(err, InferenceError::ResponseError { .. }));
        assert!(parse_chat_response("not json").is_err());
    }

    #[test]
    fn test_strip_think_blocks() {
        assert_eq!(strip_think_blocks("<think>hmm</think>\n\nParis"), "Paris");
        assert_eq!(strip_think_blocks("a<think>x</think>b<think>y</think>c"), "abc");
        assert_eq!(strip_think_blocks("answer <think>never closed"), "answer");
        assert_eq!(strip_think_blocks("no tags"), "no tags");
    }
}
