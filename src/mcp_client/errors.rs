//! MCP Client error types.

use thiserror::Error;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// A server descriptor is unusable (missing credential, bad endpoint).
    #[error("config error for server '{server}': {reason}")]
    ConfigError {
        server: String,
        reason: String,
    },

    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The initialization handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed {
        name: String,
        reason: String,
    },

    /// JSON-RPC communication error (malformed message, I/O error, HTTP failure).
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// Every connection attempt failed.
    #[error("server '{name}' unreachable after {attempts} attempts: {reason}")]
    ConnectExhausted {
        name: String,
        attempts: u32,
        reason: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Tool not found in the aggregated catalog.
    #[error("unknown tool: '{name}'")]
    UnknownTool {
        name: String,
        suggestions: Vec<String>,
    },

    /// Tool call arguments failed schema validation.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments {
        tool: String,
        reason: String,
    },

    /// The tool ran and reported failure (`isError: true`).
    #[error("tool '{tool}' failed: {message}")]
    ToolFailed {
        tool: String,
        message: String,
    },

    /// The owning connection is not in the `Ready` state.
    #[error("server '{name}' is not ready (state: {state})")]
    NotReady {
        name: String,
        state: String,
    },

    /// A request timed out.
    #[error("'{tool}' timed out after {timeout_ms}ms")]
    Timeout {
        tool: String,
        timeout_ms: u64,
    },

    /// The waiter for a response went away before the response arrived.
    #[error("request to server '{server}' was cancelled")]
    Cancelled {
        server: String,
    },

    /// Two servers export the same tool name and the policy is `reject`.
    #[error("tool name collision: '{tool}' exported by both '{first}' and '{second}'")]
    ToolCollision {
        tool: String,
        first: String,
        second: String,
    },
}

impl McpError {
    /// Whether a retry of the same connection or request might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            McpError::SpawnFailed { .. }
                | McpError::InitFailed { .. }
                | McpError::TransportError { .. }
        )
    }

    /// Whether this error comes from configuration rather than runtime.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            McpError::ConfigError { .. } | McpError::ToolCollision { .. }
        )
    }
}
