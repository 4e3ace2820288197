//! Dispatcher: routes engine tool calls to the owning MCP server.
//!
//! Every request becomes a `ToolCallResult`, never an `Err`:
//! - Validation first (tool exists in the catalog, arguments match its
//!   schema); failures here never reach the network
//! - Execution on the owning connection under a per-call timeout
//! - Bounded retry with exponential backoff for transient server errors
//!
//! Dropping an `invoke` future abandons the call; the shared connection is
//! unaffected.

use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;

use crate::mcp_client::errors::McpError;
use crate::mcp_client::registry::CatalogSnapshot;
use crate::mcp_client::types::{
    error_codes, extract_content_text, ToolCallRequest, ToolCallResult, ToolErrorKind,
};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Default per-call timeout.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Base delay between retries (doubles each attempt).
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

// ─── Dispatcher ─────────────────────────────────────────────────────────────

/// Executes tool calls against a catalog snapshot.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    tool_timeout: Duration,
    max_retries: u32,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_TOOL_TIMEOUT, 0)
    }
}

impl Dispatcher {
    pub fn new(tool_timeout: Duration, max_retries: u32) -> Self {
        Self {
            tool_timeout,
            max_retries,
        }
    }

    pub fn tool_timeout(&self) -> Duration {
        self.tool_timeout
    }

    /// Dispatch one engine decision's calls.
    ///
    /// A single call is awaited directly; several run concurrently. Results
    /// come back in request order, each carrying its request id.
    pub async fn invoke_all(
        &self,
        requests: &[ToolCallRequest],
        catalog: &CatalogSnapshot,
    ) -> Vec<ToolCallResult> {
        if let [single] = requests {
            return vec![self.invoke(single, catalog).await];
        }
        join_all(requests.iter().map(|r| self.invoke(r, catalog))).await
    }

    /// Validate and execute one call.
    pub async fn invoke(&self, request: &ToolCallRequest, catalog: &CatalogSnapshot) -> ToolCallResult {
        let start = Instant::now();

        // 1. Validate
        let tool = match catalog.validate_call(request) {
            Ok(tool) => tool,
            Err(e) => {
                let kind = match e {
                    McpError::UnknownTool { .. } => ToolErrorKind::UnknownTool,
                    _ => ToolErrorKind::InvalidArguments,
                };
                tracing::warn!(tool = %request.name, call_id = %request.id, error = %e, "tool call rejected");
                return ToolCallResult::error(request, kind, rejection_message(&e), elapsed_ms(start));
            }
        };

        // 2. Execute
        let mut attempt = 0;
        let outcome = loop {
            if attempt > 0 {
                tokio::time::sleep(retry_delay(attempt)).await;
            }

            let call = tool.connection.call_tool(&tool.remote_name, request.arguments.clone());
            match tokio::time::timeout(self.tool_timeout, call).await {
                Err(_) => {
                    break Err(McpError::Timeout {
                        tool: request.name.clone(),
                        timeout_ms: self.tool_timeout.as_millis() as u64,
                    })
                }
                Ok(Err(e)) if is_retriable_mcp_error(&e) && attempt < self.max_retries => {
                    tracing::warn!(tool = %request.name, attempt, error = %e, "retrying tool call");
                    attempt += 1;
                }
                Ok(result) => break result,
            }
        };

        let elapsed = elapsed_ms(start);
        let result = match outcome {
            Ok(payload) if reports_error(&payload) => {
                let err = McpError::ToolFailed {
                    tool: request.name.clone(),
                    message: extract_content_text(Some(&payload)),
                };
                ToolCallResult::error(request, ToolErrorKind::Execution, err.to_string(), elapsed)
            }
            Ok(payload) => ToolCallResult::ok(request, payload, elapsed),
            Err(e @ McpError::Timeout { .. }) => {
                ToolCallResult::error(request, ToolErrorKind::Timeout, e.to_string(), elapsed)
            }
            Err(e) => ToolCallResult::error(request, ToolErrorKind::Execution, e.to_string(), elapsed),
        };

        tracing::info!(
            tool = %request.name,
            server = %tool.server_id,
            call_id = %request.id,
            ok = result.is_ok(),
            error_kind = ?result.error_kind(),
            elapsed_ms = elapsed,
            "tool call finished"
        );
        result
    }
}

// ─── Free Functions ─────────────────────────────────────────────────────────

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// `tools/call` results with `isError: true` are tool-level failures.
fn reports_error(payload: &serde_json::Value) -> bool {
    payload.get("isError").and_then(|v| v.as_bool()).unwrap_or(false)
}

/// Check if an MCP error is worth retrying on the same connection.
///
/// Transport failures degrade the connection, so only server-side internal
/// errors qualify.
fn is_retriable_mcp_error(err: &McpError) -> bool {
    matches!(err, McpError::ServerError { code, .. } if *code == error_codes::INTERNAL_ERROR)
}

/// Delay before retry number `attempt` (1-based), doubling from the base.
fn retry_delay(attempt: u32) -> Duration {
    RETRY_BASE_DELAY.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
}

/// Observation text for a call rejected before dispatch.
fn rejection_message(err: &McpError) -> String {
    match err {
        McpError::UnknownTool { name, suggestions } if suggestions.is_empty() => {
            format!("Tool '{name}' does not exist.")
        }
        McpError::UnknownTool { name, suggestions } => format!(
            "Tool '{name}' does not exist. Did you mean: {}?",
            suggestions.join(", ")
        ),
        other => other.to_string(),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{catalog_with, FakeServer};
    use serde_json::json;

    #[test]
    fn test_is_retriable_mcp_error() {
        assert!(is_retriable_mcp_error(&McpError::ServerError {
            code: error_codes::INTERNAL_ERROR,
            message: "boom".into(),
            data: None,
        }));
        assert!(!is_retriable_mcp_error(&McpError::ServerError {
            code: error_codes::INVALID_PARAMS,
            message: "bad".into(),
            data: None,
        }));
        assert!(!is_retriable_mcp_error(&McpError::Timeout {
            tool: "t".into(),
            timeout_ms: 1000,
        }));
    }

    #[test]
    fn test_retry_delay_doubles_and_saturates() {
        assert_eq!(retry_delay(1), RETRY_BASE_DELAY);
        assert_eq!(retry_delay(3), RETRY_BASE_DELAY * 4);
        assert_eq!(retry_delay(40), RETRY_BASE_DELAY * u32::MAX);
    }

    #[test]
    fn test_rejection_message_lists_suggestions() {
        let msg = rejection_message(&McpError::UnknownTool {
            name: "web_serch".into(),
            suggestions: vec!["web_search".into()],
        });
        assert_eq!(msg, "Tool 'web_serch' does not exist. Did you mean: web_search?");
    }

    #[tokio::test]
    async fn test_unknown_tool_makes_no_network_call() {
        let server = FakeServer::new().tool("web_search", &["query"]);
        let (_client, catalog) = catalog_with(&[("search", server.clone())]).await;
        let dispatcher = Dispatcher::default();

        let req = ToolCallRequest::new("c1", "web_serch", json!({"query": "x"}));
        let result = dispatcher.invoke(&req, &catalog).await;
        assert_eq!(result.error_kind(), Some(ToolErrorKind::UnknownTool));
        assert_eq!(result.call_id, "c1");
        assert!(result.observation_text(100).contains("web_search"));
        assert_eq!(server.call_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_required_field_rejected_before_dispatch() {
        let server = FakeServer::new().tool("web_search", &["query"]);
        let (_client, catalog) = catalog_with(&[("search", server.clone())]).await;

        let req = ToolCallRequest::new("c1", "web_search", json!({}));
        let result = Dispatcher::default().invoke(&req, &catalog).await;
        assert_eq!(result.error_kind(), Some(ToolErrorKind::InvalidArguments));
        assert!(result.observation_text(200).contains("'query'"));
        assert_eq!(server.call_count(), 0);
    }

    #[tokio::test]
    async fn test_successful_call_routes_remote_name() {
        let server = FakeServer::new().tool("web_search", &["query"]);
        let (_client, catalog) = catalog_with(&[("search", server.clone())]).await;

        let req = ToolCallRequest::new("c1", "web_search", json!({"query": "rust"}));
        let result = Dispatcher::default().invoke(&req, &catalog).await;
        assert!(result.is_ok());
        assert!(result.observation_text(200).starts_with("web_search ok"));
        assert_eq!(server.calls(), vec![("web_search".to_string(), json!({"query": "rust"}))]);
    }

    #[tokio::test]
    async fn test_namespaced_tool_calls_remote_name() {
        let rag = FakeServer::new().tool("search", &[]);
        let web = FakeServer::new().tool("search", &[]);
        let (_client, catalog) = catalog_with(&[("rag", rag.clone()), ("web", web.clone())]).await;

        let req = ToolCallRequest::new("c1", "web__search", json!({}));
        let result = Dispatcher::default().invoke(&req, &catalog).await;
        assert!(result.is_ok());
        assert_eq!(rag.call_count(), 0);
        assert_eq!(web.calls()[0].0, "search");
    }

    #[tokio::test]
    async fn test_is_error_payload_becomes_execution_error() {
        let server = FakeServer::new()
            .tool("run_query", &["sql"])
            .failing_tool("run_query", "table 'users' does not exist");
        let (_client, catalog) = catalog_with(&[("db", server)]).await;

        let req = ToolCallRequest::new("c1", "run_query", json!({"sql": "SELECT * FROM users"}));
        let result = Dispatcher::default().invoke(&req, &catalog).await;
        assert_eq!(result.error_kind(), Some(ToolErrorKind::Execution));
        assert!(result.observation_text(200).contains("does not exist"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_yields_timeout_result() {
        let server = FakeServer::new()
            .tool("crawl", &[])
            .slow_tool("crawl", Duration::from_secs(120));
        let (_client, catalog) = catalog_with(&[("search", server)]).await;
        let dispatcher = Dispatcher::new(Duration::from_secs(2), 0);

        let req = ToolCallRequest::new("c1", "crawl", json!({}));
        let result = dispatcher.invoke(&req, &catalog).await;
        assert_eq!(result.error_kind(), Some(ToolErrorKind::Timeout));
        assert!(result.execution_time_ms >= 2000);
        assert!(result.execution_time_ms < 120_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_internal_error_is_retried() {
        let server = FakeServer::new().tool("retrieve", &[]).flaky_tool("retrieve", 1);
        let (_client, catalog) = catalog_with(&[("rag", server.clone())]).await;

        let req = ToolCallRequest::new("c1", "retrieve", json!({}));
        let without_retry = Dispatcher::new(Duration::from_secs(5), 0).invoke(&req, &catalog).await;
        assert_eq!(without_retry.error_kind(), Some(ToolErrorKind::Execution));

        let server = FakeServer::new().tool("retrieve", &[]).flaky_tool("retrieve", 1);
        let (_client, catalog) = catalog_with(&[("rag", server.clone())]).await;
        let with_retry = Dispatcher::new(Duration::from_secs(5), 2).invoke(&req, &catalog).await;
        assert!(with_retry.is_ok());
        assert_eq!(server.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoke_all_runs_concurrently_in_request_order() {
        let server = FakeServer::new()
            .tool("slow", &[])
            .tool("fast", &[])
            .slow_tool("slow", Duration::from_secs(3))
            .slow_tool("fast", Duration::from_secs(1));
        let (_client, catalog) = catalog_with(&[("fs", server)]).await;

        let requests = vec![
            ToolCallRequest::new("a", "slow", json!({})),
            ToolCallRequest::new("b", "fast", json!({})),
            ToolCallRequest::new("c", "missing", json!({})),
        ];
        let start = Instant::now();
        let results = Dispatcher::default().invoke_all(&requests, &catalog).await;
        let ids: Vec<&str> = results.iter().map(|r| r.call_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(results[0].is_ok() && results[1].is_ok());
        assert_eq!(results[2].error_kind(), Some(ToolErrorKind::UnknownTool));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_degraded_connection_is_execution_error() {
        let server = FakeServer::new().tool("list_dir", &[]);
        let (client, catalog) = catalog_with(&[("fs", server)]).await;
        client.connection("fs").unwrap().mark_degraded("gone");

        let req = ToolCallRequest::new("c1", "list_dir", json!({}));
        let result = Dispatcher::default().invoke(&req, &catalog).await;
        assert_eq!(result.error_kind(), Some(ToolErrorKind::Execution));
        assert!(result.observation_text(200).contains("not ready"));
    }
}
