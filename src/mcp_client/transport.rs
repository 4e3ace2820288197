//! JSON-RPC transports.
//!
//! `Transport` is the seam between a `Connection` and the wire. Two
//! implementations exist:
//! - `StdioTransport` (here): a child process speaking line-delimited JSON
//!   on stdin/stdout. A background reader task routes each response to the
//!   waiter registered under its request id, so concurrent requests from
//!   different sessions share one pipe.
//! - `HttpTransport` (`http.rs`): MCP streamable HTTP.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::types::{error_codes, JsonRpcRequest, JsonRpcResponse};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for graceful shutdown before force-killing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of stderr lines kept for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Transport Trait ─────────────────────────────────────────────────────────

/// A bidirectional JSON-RPC channel to one server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for the response with the same id.
    ///
    /// Dropping the returned future abandons the request; the transport
    /// stays usable for other callers.
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError>;

    /// Send a notification (no response expected).
    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<(), McpError>;

    /// Release the underlying resources. Idempotent.
    async fn close(&self);
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── StdioTransport ──────────────────────────────────────────────────────────

type PendingMap = HashMap<u64, oneshot::Sender<JsonRpcResponse>>;

/// State shared between the transport handle and its reader task.
struct StdioShared {
    server_name: String,
    writer: Mutex<Option<ChildStdin>>,
    pending: StdMutex<PendingMap>,
    /// Set once stdout hits EOF or the transport is closed.
    closed: AtomicBool,
    stderr_tail: StdMutex<VecDeque<String>>,
}

impl StdioShared {
    fn transport_error(&self, reason: impl Into<String>) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason: reason.into(),
        }
    }

    async fn write_line(&self, value: &serde_json::Value) -> Result<(), McpError> {
        let mut json = serde_json::to_string(value)
            .map_err(|e| self.transport_error(format!("failed to serialize message: {e}")))?;
        json.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| self.transport_error("stdin already closed"))?;
        writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| self.transport_error(format!("failed to write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| self.transport_error(format!("failed to flush stdin: {e}")))?;
        Ok(())
    }

    /// Drop every registered waiter so blocked requests fail immediately.
    fn fail_all_pending(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
    }

    fn recent_stderr(&self) -> String {
        self.stderr_tail
            .lock()
            .map(|tail| tail.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default()
    }
}

/// Removes a pending entry when the waiting future is dropped early.
struct PendingGuard<'a> {
    shared: &'a StdioShared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

/// JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    shared: Arc<StdioShared>,
    child: Mutex<Option<Child>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl StdioTransport {
    /// Spawn the server process and start the reader tasks.
    pub fn spawn(
        server_name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&str>,
    ) -> Result<Self, McpError> {
        let mut cmd = Command::new(command);
        cmd.args(args);
        for (key, value) in env {
            cmd.env(key, value);
        }
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: server_name.to_string(),
            reason: format!("{command}: {e}"),
        })?;

        let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
            name: server_name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
            name: server_name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr = child.stderr.take();

        let shared = Arc::new(StdioShared {
            server_name: server_name.to_string(),
            writer: Mutex::new(Some(stdin)),
            pending: StdMutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            stderr_tail: StdMutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)),
        });

        let mut tasks = vec![tokio::spawn(reader_loop(Arc::clone(&shared), stdout))];
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(stderr_loop(Arc::clone(&shared), stderr)));
        }

        tracing::debug!(server = server_name, command, "spawned stdio server");

        Ok(Self {
            shared,
            child: Mutex::new(Some(child)),
            tasks: StdMutex::new(tasks),
            shut_down: AtomicBool::new(false),
        })
    }

    /// The last lines the server wrote to stderr.
    pub fn recent_stderr(&self) -> String {
        self.shared.recent_stderr()
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(self.shared.transport_error("server stdout closed (process may have exited)"));
        }

        let id = next_request_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self
                .shared
                .pending
                .lock()
                .map_err(|_| self.shared.transport_error("pending map poisoned"))?;
            pending.insert(id, tx);
        }
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(self.shared.transport_error("server stdout closed (process may have exited)"));
        }

        let req = JsonRpcRequest::new(id, method, params);
        let value = serde_json::to_value(&req)
            .map_err(|e| self.shared.transport_error(format!("failed to serialize request: {e}")))?;
        self.shared.write_line(&value).await?;

        rx.await.map_err(|_| {
            let stderr = self.shared.recent_stderr();
            let suffix = if stderr.is_empty() {
                String::new()
            } else {
                format!(" | stderr: {}", stderr.trim())
            };
            self.shared
                .transport_error(format!("server stdout closed before responding{suffix}"))
        })
    }

    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<(), McpError> {
        let mut notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let Some(params) = params {
            notification["params"] = params;
        }
        self.shared.write_line(&notification).await
    }

    async fn close(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        // Closing stdin is the MCP stdio shutdown signal.
        self.shared.writer.lock().await.take();

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(server = %self.shared.server_name, %status, "server exited");
                }
                _ => {
                    tracing::warn!(
                        server = %self.shared.server_name,
                        "server did not exit in time, killing"
                    );
                    let _ = child.kill().await;
                }
            }
        }

        self.shared.closed.store(true, Ordering::Release);
        self.shared.fail_all_pending();
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

// ─── Reader Tasks ────────────────────────────────────────────────────────────

/// Route server output to waiters until stdout closes.
async fn reader_loop(shared: Arc<StdioShared>, stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<serde_json::Value>(trimmed) {
                    Ok(value) => handle_inbound(&shared, value).await,
                    Err(_) => {
                        // Servers sometimes log to stdout; skip non-JSON lines.
                        tracing::debug!(server = %shared.server_name, line = trimmed, "skipping non-JSON line");
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(server = %shared.server_name, error = %e, "stdout read failed");
                break;
            }
        }
    }

    shared.closed.store(true, Ordering::Release);
    shared.fail_all_pending();
    tracing::info!(server = %shared.server_name, "server stdout closed");
}

async fn handle_inbound(shared: &StdioShared, value: serde_json::Value) {
    let has_method = value.get("method").is_some();
    let id = value.get("id").cloned();

    match (id, has_method) {
        // Server-initiated request.
        (Some(id), true) => {
            let method = value.get("method").and_then(|m| m.as_str()).unwrap_or_default();
            let reply = if method == "ping" {
                serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {}})
            } else {
                tracing::debug!(server = %shared.server_name, method, "unsupported server request");
                serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {
                        "code": error_codes::METHOD_NOT_FOUND,
                        "message": format!("client does not implement '{method}'"),
                    }
                })
            };
            if let Err(e) = shared.write_line(&reply).await {
                tracing::warn!(server = %shared.server_name, error = %e, "failed to answer server request");
            }
        }
        // Response to one of our requests.
        (Some(_), false) => match serde_json::from_value::<JsonRpcResponse>(value) {
            Ok(resp) => {
                let waiter = shared.pending.lock().ok().and_then(|mut p| p.remove(&resp.id));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(resp);
                    }
                    None => {
                        tracing::debug!(
                            server = %shared.server_name,
                            id = resp.id,
                            "response for abandoned or unknown request"
                        );
                    }
                }
            }
            Err(e) => {
                // Its waiter cannot be found; the request runs into its timeout.
                tracing::warn!(server = %shared.server_name, error = %e, "malformed JSON-RPC response");
            }
        },
        (None, true) => {
            let method = value.get("method").and_then(|m| m.as_str()).unwrap_or_default();
            tracing::debug!(server = %shared.server_name, method, "server notification");
        }
        (None, false) => {}
    }
}

/// Keep the stderr pipe drained and remember its tail.
async fn stderr_loop(shared: Arc<StdioShared>, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(server = %shared.server_name, stderr = %line, "server stderr");
        if let Ok(mut tail) = shared.stderr_tail.lock() {
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
