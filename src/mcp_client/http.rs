//! MCP streamable HTTP transport.
//!
//! Every JSON-RPC message is a `POST` to the server endpoint. The server
//! answers with either a plain JSON body or an SSE stream whose `data:`
//! events carry the response. The `Mcp-Session-Id` header returned by
//! `initialize` is echoed on every later request and the session is ended
//! with a `DELETE` on close.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::Client as HttpClient;

use super::errors::McpError;
use super::transport::{next_request_id, Transport};
use super::types::{id_as_u64, JsonRpcRequest, JsonRpcResponse};

/// Session header defined by the streamable HTTP transport.
const SESSION_HEADER: &str = "mcp-session-id";

/// Accept header value required by the streamable HTTP transport.
const ACCEPT_BOTH: &str = "application/json, text/event-stream";

/// How long the session `DELETE` may take on close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// JSON-RPC transport over MCP streamable HTTP.
pub struct HttpTransport {
    server_name: String,
    url: String,
    http: HttpClient,
    headers: HeaderMap,
    session_id: StdMutex<Option<String>>,
    closed: AtomicBool,
    close_timeout: Duration,
}

impl HttpTransport {
    /// Create a transport for `url`. No network traffic happens until the
    /// first request.
    pub fn new(
        server_name: &str,
        url: &str,
        headers: &HashMap<String, String>,
        http: HttpClient,
    ) -> Result<Self, McpError> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(McpError::ConfigError {
                server: server_name.to_string(),
                reason: format!("invalid endpoint URL '{url}'"),
            });
        }

        let mut header_map = HeaderMap::new();
        for (key, value) in headers {
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| McpError::ConfigError {
                server: server_name.to_string(),
                reason: format!("invalid header name '{key}': {e}"),
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| McpError::ConfigError {
                server: server_name.to_string(),
                reason: format!("invalid value for header '{key}': {e}"),
            })?;
            header_map.insert(name, value);
        }

        Ok(Self {
            server_name: server_name.to_string(),
            url: url.to_string(),
            http,
            headers: header_map,
            session_id: StdMutex::new(None),
            closed: AtomicBool::new(false),
            close_timeout: CLOSE_TIMEOUT,
        })
    }

    #[cfg(test)]
    fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Session id assigned by the server, if any.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().ok().and_then(|s| s.clone())
    }

    fn transport_error(&self, reason: impl Into<String>) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason: reason.into(),
        }
    }

    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response, McpError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.transport_error("transport closed"));
        }

        let mut req = self
            .http
            .post(&self.url)
            .headers(self.headers.clone())
            .header(ACCEPT, ACCEPT_BOTH)
            .json(body);
        if let Some(session) = self.session_id() {
            req = req.header(SESSION_HEADER, session);
        }

        let response = req.send().await.map_err(|e| {
            let kind = if e.is_connect() {
                "connection failed"
            } else if e.is_timeout() {
                "request timed out"
            } else {
                "request failed"
            };
            self.transport_error(format!("{kind}: {e}"))
        })?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            if let Ok(mut slot) = self.session_id.lock() {
                *slot = Some(session.to_string());
            }
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.transport_error(format!("HTTP {}: {}", status.as_u16(), body.trim())));
        }

        Ok(response)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let req = JsonRpcRequest::new(id, method, params);
        let body = serde_json::to_value(&req)
            .map_err(|e| self.transport_error(format!("failed to serialize request: {e}")))?;

        let response = self.post(&body).await?;
        let is_sse = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false);

        if is_sse {
            return read_sse_response(response.bytes_stream(), id)
                .await
                .map_err(|reason| self.transport_error(reason));
        }

        let text = response
            .text()
            .await
            .map_err(|e| self.transport_error(format!("failed to read response body: {e}")))?;
        parse_response_for(&text, id).map_err(|reason| self.transport_error(reason))
    }

    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<(), McpError> {
        let mut notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let Some(params) = params {
            notification["params"] = params;
        }
        // Servers answer notifications with 202 Accepted and no body.
        self.post(&notification).await.map(|_| ())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(session) = self.session_id() else {
            return;
        };
        let delete = self
            .http
            .delete(&self.url)
            .headers(self.headers.clone())
            .header(SESSION_HEADER, session)
            .send();
        match tokio::time::timeout(self.close_timeout, delete).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::debug!(server = %self.server_name, error = %e, "session DELETE failed");
            }
            Err(_) => {
                tracing::warn!(
                    server = %self.server_name,
                    timeout_ms = self.close_timeout.as_millis() as u64,
                    "session DELETE timed out"
                );
            }
        }
    }
}

// ─── Body Parsing ────────────────────────────────────────────────────────────

/// Parse a JSON body that holds either one response or a batch.
fn parse_response_for(body: &str, id: u64) -> Result<JsonRpcResponse, String> {
    let value: serde_json::Value =
        serde_json::from_str(body.trim()).map_err(|e| format!("invalid JSON response: {e}"))?;

    let candidates = match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };

    for candidate in candidates {
        if candidate.get("id").and_then(id_as_u64) == Some(id) {
            return serde_json::from_value(candidate)
                .map_err(|e| format!("malformed JSON-RPC response: {e}"));
        }
    }
    Err(format!("no response with id {id} in body"))
}

/// Extract the response with `id` from the `data:` lines of one SSE event.
fn response_from_event(event: &str, id: u64) -> Option<JsonRpcResponse> {
    let data: Vec<&str> = event
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|d| d.strip_prefix(' ').unwrap_or(d))
        .collect();
    if data.is_empty() {
        return None;
    }
    parse_response_for(&data.join("\n"), id).ok()
}

/// Read SSE events until the one answering `id` arrives.
///
/// Bytes are buffered until a whole event is present, so a multi-byte
/// character split across network chunks decodes intact.
async fn read_sse_response<S, B, E>(stream: S, id: u64) -> Result<JsonRpcResponse, String>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: fmt::Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut buffer: Vec<u8> = Vec::new();

    loop {
        while let Some(end) = event_end(&buffer) {
            let event: Vec<u8> = buffer.drain(..end + 2).collect();
            let text = String::from_utf8_lossy(&event[..end]);
            if let Some(resp) = response_from_event(&text, id) {
                return Ok(resp);
            }
        }

        match stream.next().await {
            // CR never occurs inside a UTF-8 sequence, so dropping it
            // normalizes CRLF framing without touching the payload.
            Some(Ok(chunk)) => buffer.extend(chunk.as_ref().iter().copied().filter(|b| *b != b'\r')),
            Some(Err(e)) => return Err(format!("event stream read error: {e}")),
            None => {
                let text = String::from_utf8_lossy(&buffer);
                return response_from_event(text.trim(), id)
                    .ok_or_else(|| format!("event stream ended without a response for id {id}"));
            }
        }
    }
}

/// Offset of the blank line ending the first complete event.
fn event_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

// ─── Tests ───────────────────────────────────────────────────────────────────
