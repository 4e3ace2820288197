//! Connection lifecycle management.
//!
//! A `Connection` is the long-lived runtime handle for one configured
//! server. It moves through `Connecting → Ready`, drops to `Degraded` when
//! every connection attempt fails or the transport breaks, and ends in
//! `Closed`. Reconnecting swaps a fresh transport into the same handle, so
//! references held by a catalog stay valid.

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use tokio::time::sleep;

use super::errors::McpError;
use super::http::HttpTransport;
use super::transport::{extract_result, StdioTransport, Transport};
use super::types::{InitializeResult, ServerDescriptor, TransportConfig, PROTOCOL_VERSION};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default maximum connection attempts before a server is marked Degraded.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay between attempts (doubles each time).
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Default timeout for transport setup plus the initialize handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// TCP connect timeout for HTTP servers.
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on releasing a transport. A server that never acknowledges
/// shutdown must not stall reconnects or exit.
const TRANSPORT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Retry Policy ────────────────────────────────────────────────────────────

/// Bounded retry with exponential backoff for connection attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub connect_timeout: Duration,
}

impl RetryPolicy {
    /// Delay before attempt number `attempt` (0-based). Attempt 0 runs immediately.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            Duration::ZERO
        } else {
            self.backoff_base * 2u32.saturating_pow(attempt - 1)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

// ─── Connector ───────────────────────────────────────────────────────────────

/// Opens a raw transport for a descriptor.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, descriptor: &ServerDescriptor) -> Result<Arc<dyn Transport>, McpError>;
}

/// Opens real stdio and HTTP transports.
pub struct DefaultConnector {
    http: HttpClient,
}

impl DefaultConnector {
    pub fn new() -> Result<Self, McpError> {
        let http = HttpClient::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| McpError::ConfigError {
                server: "*".into(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn open(&self, descriptor: &ServerDescriptor) -> Result<Arc<dyn Transport>, McpError> {
        match &descriptor.transport {
            TransportConfig::Stdio {
                command,
                args,
                env,
                cwd,
            } => {
                let transport =
                    StdioTransport::spawn(&descriptor.id, command, args, env, cwd.as_deref())?;
                Ok(Arc::new(transport))
            }
            TransportConfig::StreamableHttp { url, headers } => {
                let transport = HttpTransport::new(&descriptor.id, url, headers, self.http.clone())?;
                Ok(Arc::new(transport))
            }
        }
    }
}

// ─── Connection ──────────────────────────────────────────────────────────────

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Ready,
    Degraded,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug)]
struct ConnectionStatus {
    state: ConnectionState,
    last_error: Option<String>,
    server_name: Option<String>,
    server_version: Option<String>,
}

/// Runtime handle bound to one `ServerDescriptor`.
///
/// Owned by the connection manager; catalogs and the dispatcher share it
/// through `Arc`.
pub struct Connection {
    descriptor: ServerDescriptor,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    status: StdMutex<ConnectionStatus>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.descriptor.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// A connection that has not been established yet.
    pub fn new(descriptor: ServerDescriptor) -> Self {
        Self {
            descriptor,
            transport: RwLock::new(None),
            status: StdMutex::new(ConnectionStatus {
                state: ConnectionState::Connecting,
                last_error: None,
                server_name: None,
                server_version: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> ConnectionState {
        self.status
            .lock()
            .map(|s| s.state)
            .unwrap_or(ConnectionState::Degraded)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Most recent failure reason, if any.
    pub fn last_error(&self) -> Option<String> {
        self.status.lock().ok().and_then(|s| s.last_error.clone())
    }

    /// `name version` reported by the server during the handshake.
    pub fn server_label(&self) -> Option<String> {
        let status = self.status.lock().ok()?;
        match (&status.server_name, &status.server_version) {
            (Some(name), Some(version)) => Some(format!("{name} {version}")),
            (Some(name), None) => Some(name.clone()),
            _ => None,
        }
    }

    fn set_state(&self, state: ConnectionState, error: Option<String>) {
        if let Ok(mut status) = self.status.lock() {
            // Closed is terminal.
            if status.state == ConnectionState::Closed {
                return;
            }
            status.state = state;
            if error.is_some() {
                status.last_error = error;
            }
        }
    }

    /// Take the connection out of service after a failure.
    pub fn mark_degraded(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(server = %self.descriptor.id, reason = %reason, "server degraded");
        self.set_state(ConnectionState::Degraded, Some(reason));
    }

    fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.read().ok().and_then(|t| t.clone())
    }

    fn install_transport(&self, transport: Option<Arc<dyn Transport>>) -> Option<Arc<dyn Transport>> {
        match self.transport.write() {
            Ok(mut slot) => std::mem::replace(&mut *slot, transport),
            Err(_) => None,
        }
    }

    /// Establish the connection: credential check, transport, handshake.
    ///
    /// Transient failures are retried per `policy`. On final failure the
    /// connection is left `Degraded` with the error recorded.
    pub async fn establish(
        &self,
        connector: &dyn Connector,
        policy: &RetryPolicy,
    ) -> Result<(), McpError> {
        let server = self.descriptor.id.as_str();

        if let Some(reason) = self.descriptor.transport_problem() {
            let err = McpError::ConfigError {
                server: server.to_string(),
                reason,
            };
            self.mark_degraded(err.to_string());
            return Err(err);
        }

        let missing = self.descriptor.missing_env();
        if !missing.is_empty() {
            let err = McpError::ConfigError {
                server: server.to_string(),
                reason: format!("missing required environment variable(s): {}", missing.join(", ")),
            };
            self.mark_degraded(err.to_string());
            return Err(err);
        }

        let timeout = self
            .descriptor
            .connect_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(policy.connect_timeout);
        let attempts = policy.max_attempts.max(1);
        let mut last_error: Option<McpError> = None;

        for attempt in 0..attempts {
            let delay = policy.delay_before(attempt);
            if !delay.is_zero() {
                tracing::info!(server, attempt, delay_ms = delay.as_millis() as u64, "retrying connection");
                sleep(delay).await;
            }
            self.set_state(ConnectionState::Connecting, None);

            let outcome = tokio::time::timeout(timeout, self.open_and_initialize(connector)).await;
            match outcome {
                Ok(Ok(())) => {
                    self.set_state(ConnectionState::Ready, None);
                    tracing::info!(
                        server,
                        transport = self.descriptor.transport.kind(),
                        attempt,
                        "server connected"
                    );
                    return Ok(());
                }
                Ok(Err(e)) if e.is_transient() => {
                    tracing::warn!(server, attempt, error = %e, "connection attempt failed");
                    last_error = Some(e);
                }
                Ok(Err(e)) => {
                    self.mark_degraded(e.to_string());
                    return Err(e);
                }
                Err(_) => {
                    tracing::warn!(server, attempt, timeout_secs = timeout.as_secs(), "connection attempt timed out");
                    last_error = Some(McpError::InitFailed {
                        name: server.to_string(),
                        reason: format!("handshake timed out after {}s", timeout.as_secs()),
                    });
                }
            }

            if let Some(stale) = self.install_transport(None) {
                self.release(stale).await;
            }
        }

        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        let err = McpError::ConnectExhausted {
            name: server.to_string(),
            attempts,
            reason,
        };
        self.mark_degraded(err.to_string());
        Err(err)
    }

    async fn open_and_initialize(&self, connector: &dyn Connector) -> Result<(), McpError> {
        let transport = connector.open(&self.descriptor).await?;
        // Installed before the handshake so a timeout can still close it.
        if let Some(previous) = self.install_transport(Some(Arc::clone(&transport))) {
            self.release(previous).await;
        }
        let init = handshake(transport.as_ref(), &self.descriptor.id).await?;
        if let Ok(mut status) = self.status.lock() {
            if let Some(info) = init.server_info {
                status.server_name = info.name;
                status.server_version = info.version;
            }
        }
        Ok(())
    }

    /// Send a request over the live transport and unwrap its result.
    ///
    /// Transport failures degrade the connection.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        let state = self.state();
        if state != ConnectionState::Ready {
            return Err(McpError::NotReady {
                name: self.descriptor.id.clone(),
                state: state.to_string(),
            });
        }
        let transport = self.current_transport().ok_or_else(|| McpError::NotReady {
            name: self.descriptor.id.clone(),
            state: "no transport".into(),
        })?;

        match transport.request(method, params).await {
            Ok(response) => extract_result(response),
            Err(e) => {
                if matches!(e, McpError::TransportError { .. }) {
                    self.mark_degraded(e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Invoke a tool by its server-side name.
    pub async fn call_tool(
        &self,
        remote_name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        let arguments = match arguments {
            serde_json::Value::Null => serde_json::json!({}),
            other => other,
        };
        let params = serde_json::json!({
            "name": remote_name,
            "arguments": arguments,
        });
        self.request("tools/call", Some(params)).await
    }

    /// Release the transport and mark the connection Closed. Idempotent.
    pub async fn close(&self) {
        if let Ok(mut status) = self.status.lock() {
            status.state = ConnectionState::Closed;
        }
        if let Some(transport) = self.install_transport(None) {
            self.release(transport).await;
            tracing::info!(server = %self.descriptor.id, "connection closed");
        }
    }

    async fn release(&self, transport: Arc<dyn Transport>) {
        if tokio::time::timeout(TRANSPORT_CLOSE_TIMEOUT, transport.close())
            .await
            .is_err()
        {
            tracing::warn!(
                server = %self.descriptor.id,
                timeout_secs = TRANSPORT_CLOSE_TIMEOUT.as_secs(),
                "transport close timed out, abandoning it"
            );
        }
    }
}

/// Establish a connection for `descriptor`, returning it only when Ready.
pub async fn connect(
    descriptor: ServerDescriptor,
    connector: &dyn Connector,
    policy: &RetryPolicy,
) -> Result<Arc<Connection>, McpError> {
    let connection = Arc::new(Connection::new(descriptor));
    connection.establish(connector, policy).await?;
    Ok(connection)
}

/// Perform the MCP initialization handshake.
async fn handshake(transport: &dyn Transport, server_name: &str) -> Result<InitializeResult, McpError> {
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        }
    });
    let response = transport.request("initialize", Some(params)).await?;
    let result = extract_result(response).map_err(|e| McpError::InitFailed {
        name: server_name.to_string(),
        reason: e.to_string(),
    })?;

    let init: InitializeResult = serde_json::from_value(result).map_err(|e| McpError::InitFailed {
        name: server_name.to_string(),
        reason: format!("failed to parse initialize response: {e}"),
    })?;

    transport.notify("notifications/initialized", None).await?;
    tracing::debug!(
        server = server_name,
        protocol = init.protocol_version.as_deref().unwrap_or("unknown"),
        "handshake complete"
    );
    Ok(init)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
