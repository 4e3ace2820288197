//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types, MCP protocol structures, server descriptors,
//! and the request/result records exchanged with the agent loop.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// MCP protocol revision sent in `initialize`.
pub const PROTOCOL_VERSION: &str = "2025-06-18";

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[allow(dead_code)]
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(deserialize_with = "deserialize_id")]
    pub id: u64,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Build a success response (used by in-process transports).
    pub fn success(id: u64, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response (used by in-process transports).
    pub fn failure(id: u64, code: i32, message: &str) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.to_string(),
                data: None,
            }),
        }
    }
}

/// Read a JSON-RPC id. Requests carry numeric ids; some servers echo them
/// back as strings.
pub fn id_as_u64(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn deserialize_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    id_as_u64(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("unsupported JSON-RPC id {value}")))
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// MCP tool definition as returned by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "inputSchema", alias = "input_schema")]
    pub input_schema: serde_json::Value,
}

/// `tools/list` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<McpToolDefinition>,
    #[serde(default, rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// MCP initialize response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default, rename = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, rename = "serverInfo")]
    pub server_info: Option<ServerInfo>,
    #[serde(default)]
    pub instructions: Option<String>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

// ─── Server Descriptors ──────────────────────────────────────────────────────

/// How to reach one tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Child process speaking line-delimited JSON-RPC on stdin/stdout.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        cwd: Option<String>,
    },
    /// MCP streamable HTTP endpoint.
    StreamableHttp {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl TransportConfig {
    /// Short label for logs and status output.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportConfig::Stdio { .. } => "stdio",
            TransportConfig::StreamableHttp { .. } => "streamable_http",
        }
    }

    /// Command line or URL, for display.
    pub fn target(&self) -> String {
        match self {
            TransportConfig::Stdio { command, args, .. } => {
                if args.is_empty() {
                    command.clone()
                } else {
                    format!("{command} {}", args.join(" "))
                }
            }
            TransportConfig::StreamableHttp { url, .. } => url.clone(),
        }
    }
}

/// A configured tool server. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Unique server id, also the namespace prefix on name collisions.
    pub id: String,
    pub transport: TransportConfig,
    /// Environment variables that must be set (and non-empty) before connecting.
    #[serde(default)]
    pub required_env: Vec<String>,
    /// Per-server override of the connect/handshake timeout.
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
}

impl ServerDescriptor {
    /// Names from `required_env` that are unset or empty.
    pub fn missing_env(&self) -> Vec<String> {
        self.required_env
            .iter()
            .filter(|name| std::env::var(name).map(|v| v.is_empty()).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Why the transport settings can never connect, if they cannot.
    pub fn transport_problem(&self) -> Option<String> {
        match &self.transport {
            TransportConfig::Stdio { command, .. } if command.trim().is_empty() => {
                Some("stdio command is empty".into())
            }
            TransportConfig::StreamableHttp { url, .. }
                if !(url.starts_with("http://") || url.starts_with("https://")) =>
            {
                Some(format!("url must be http(s), got '{url}'"))
            }
            _ => None,
        }
    }
}

// ─── Tool Calls ──────────────────────────────────────────────────────────────

/// One tool invocation requested by the reasoning engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Correlates the result with this request when calls run in parallel.
    pub id: String,
    /// Catalog name of the tool.
    pub name: String,
    pub arguments: serde_json::Value,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Outcome status of a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Ok,
    Error,
}

/// Category of a failed tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    /// Name absent from the catalog. Never reached the network.
    UnknownTool,
    /// Arguments rejected by the tool's schema. Never reached the network.
    InvalidArguments,
    /// The server failed the call, or the connection was unusable.
    Execution,
    /// No response within the per-call timeout.
    Timeout,
    /// The session was cancelled while the call was in flight.
    Cancelled,
}

impl fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ToolErrorKind::UnknownTool => "unknown tool",
            ToolErrorKind::InvalidArguments => "invalid arguments",
            ToolErrorKind::Execution => "execution error",
            ToolErrorKind::Timeout => "timeout",
            ToolErrorKind::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Error detail attached to a failed `ToolCallResult`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallError {
    pub kind: ToolErrorKind,
    pub message: String,
}

/// Result of a tool call execution.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallResult {
    pub call_id: String,
    pub tool_name: String,
    pub status: ToolCallStatus,
    pub payload: Option<serde_json::Value>,
    pub error: Option<ToolCallError>,
    pub execution_time_ms: u64,
}

impl ToolCallResult {
    /// Successful call carrying the server's result payload.
    pub fn ok(request: &ToolCallRequest, payload: serde_json::Value, execution_time_ms: u64) -> Self {
        Self {
            call_id: request.id.clone(),
            tool_name: request.name.clone(),
            status: ToolCallStatus::Ok,
            payload: Some(payload),
            error: None,
            execution_time_ms,
        }
    }

    /// Failed call.
    pub fn error(
        request: &ToolCallRequest,
        kind: ToolErrorKind,
        message: impl Into<String>,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            call_id: request.id.clone(),
            tool_name: request.name.clone(),
            status: ToolCallStatus::Error,
            payload: None,
            error: Some(ToolCallError {
                kind,
                message: message.into(),
            }),
            execution_time_ms,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ToolCallStatus::Ok
    }

    /// Error category, if the call failed.
    pub fn error_kind(&self) -> Option<ToolErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Text fed back to the reasoning engine as the observation.
    ///
    /// Successful payloads are capped at `max_chars` bytes.
    pub fn observation_text(&self, max_chars: usize) -> String {
        match (&self.status, &self.error) {
            (ToolCallStatus::Error, Some(err)) => format!("Error ({}): {}", err.kind, err.message),
            (ToolCallStatus::Error, None) => "Error: tool call failed".to_string(),
            (ToolCallStatus::Ok, _) => {
                let text = extract_content_text(self.payload.as_ref());
                truncate_text(&text, max_chars)
            }
        }
    }
}

// ─── Result Text ─────────────────────────────────────────────────────────────

/// Flatten an MCP `tools/call` result into plain text.
///
/// Joins the `text` items of the `content` array. Falls back to
/// `structuredContent`, then to the pretty-printed payload.
pub fn extract_content_text(payload: Option<&serde_json::Value>) -> String {
    let Some(value) = payload else {
        return "No result returned.".to_string();
    };

    if let Some(items) = value.get("content").and_then(|c| c.as_array()) {
        let texts: Vec<&str> = items
            .iter()
            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
            .collect();
        if !texts.is_empty() {
            return texts.join("\n");
        }
    }

    if let Some(structured) = value.get("structuredContent") {
        if let Ok(s) = serde_json::to_string_pretty(structured) {
            return s;
        }
    }

    match serde_json::to_string_pretty(value) {
        Ok(s) => s,
        Err(_) => format!("{value:?}"),
    }
}

/// Cap `text` at `max_bytes`, cutting on a char boundary and noting the cut.
pub fn truncate_text(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{}\n\n[... truncated: showing first {end} of {} chars]",
        &text[..end],
        text.len()
    )
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request_omits_missing_params() {
        let req = JsonRpcRequest::new(1, "tools/list", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"method\":\"tools/list\""));
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_json_rpc_error_response() {
        let json = r#"{
            "jsonrpc": "2.0",
            "id": 2,
            "error": {"code": -32601, "message": "Method not found"}
        }"#;
        let resp: JsonRpcResponse = serde_json::from_str(json).unwrap();
        assert!(resp.result.is_none());
        assert_eq!(resp.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_json_rpc_response_accepts_string_id() {
        let resp: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"42","result":{}}"#).unwrap();
        assert_eq!(resp.id, 42);

        let foreign = serde_json::from_str::<JsonRpcResponse>(r#"{"jsonrpc":"2.0","id":"req-a","result":{}}"#);
        let err = foreign.unwrap_err().to_string();
        assert!(err.contains("unsupported JSON-RPC id"), "{err}");
    }

    #[test]
    fn test_tool_definition_reads_input_schema() {
        let json = r#"{
            "name": "web_search",
            "description": "Search the web",
            "inputSchema": {"type": "object", "required": ["query"]}
        }"#;
        let tool: McpToolDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(tool.input_schema["required"][0], "query");
    }

    #[test]
    fn test_list_tools_cursor() {
        let json = r#"{"tools": [{"name": "a"}], "nextCursor": "page-2"}"#;
        let page: ListToolsResult = serde_json::from_str(json).unwrap();
        assert_eq!(page.tools.len(), 1);
        assert_eq!(page.next_cursor.as_deref(), Some("page-2"));
    }

    #[test]
    fn test_descriptor_yaml_http() {
        let yaml = r#"
            id: search
            transport:
              type: streamable_http
              url: http://localhost:1000/mcp/
        "#;
        let desc: ServerDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(desc.transport.kind(), "streamable_http");
        assert!(desc.required_env.is_empty());
    }

    #[test]
    fn test_descriptor_yaml_stdio() {
        let yaml = r#"
            id: fs
            transport:
              type: stdio
              command: python
              args: ["fs_mcp_server.py"]
            required_env: [DEFAULT_FS_PATH]
        "#;
        let desc: ServerDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(desc.transport.target(), "python fs_mcp_server.py");
        assert_eq!(desc.required_env, vec!["DEFAULT_FS_PATH"]);
    }

    #[test]
    fn test_missing_env_reports_unset_names() {
        std::env::remove_var("__MCP_AGENT_TEST_UNSET__");
        let desc = ServerDescriptor {
            id: "search".into(),
            transport: TransportConfig::StreamableHttp {
                url: "http://localhost:1000/mcp/".into(),
                headers: HashMap::new(),
            },
            required_env: vec!["__MCP_AGENT_TEST_UNSET__".into()],
            connect_timeout_secs: None,
        };
        assert_eq!(desc.missing_env(), vec!["__MCP_AGENT_TEST_UNSET__"]);
    }

    #[test]
    fn test_extract_content_text_joins_text_items() {
        let payload = serde_json::json!({
            "content": [
                {"type": "text", "text": "line one"},
                {"type": "image", "data": "..."},
                {"type": "text", "text": "line two"}
            ],
            "isError": false
        });
        assert_eq!(extract_content_text(Some(&payload)), "line one\nline two");
    }

    #[test]
    fn test_extract_content_text_falls_back_to_json() {
        let payload = serde_json::json!({"rows": 3});
        assert!(extract_content_text(Some(&payload)).contains("\"rows\": 3"));
        assert_eq!(extract_content_text(None), "No result returned.");
    }

    #[test]
    fn test_truncate_text_respects_char_boundary() {
        let text = "日本語のテキスト";
        let out = truncate_text(text, 4);
        assert!(out.starts_with("日"));
        assert!(out.contains("truncated"));
        assert_eq!(truncate_text("short", 100), "short");
    }

    #[test]
    fn test_observation_text_for_error() {
        let req = ToolCallRequest::new("call_1", "query", serde_json::json!({}));
        let result = ToolCallResult::error(&req, ToolErrorKind::Timeout, "no reply in 30000ms", 30_000);
        assert_eq!(result.observation_text(100), "Error (timeout): no reply in 30000ms");
        assert_eq!(result.error_kind(), Some(ToolErrorKind::Timeout));
        assert!(!result.is_ok());
    }
}
