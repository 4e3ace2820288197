//! In-process fakes for unit tests: an MCP server behind the `Transport`
//! and `Connector` seams, a scripted `ReasoningEngine`, and a recording
//! `LoopObserver`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agent_core::agent_loop::LoopObserver;
use crate::agent_core::engine::{EngineDecision, ReasoningEngine};
use crate::agent_core::session::Session;
use crate::agent_core::types::LoopState;
use crate::inference::errors::InferenceError;
use crate::mcp_client::client::{ClientSettings, McpClient};
use crate::mcp_client::errors::McpError;
use crate::mcp_client::lifecycle::{Connector, RetryPolicy};
use crate::mcp_client::registry::{CatalogSnapshot, CollisionPolicy};
use crate::mcp_client::transport::{next_request_id, Transport};
use crate::mcp_client::types::{
    error_codes, JsonRpcResponse, ServerDescriptor, ToolCallRequest, ToolCallResult, TransportConfig,
};

/// A streamable HTTP descriptor for `id`. Never dialled by the fakes.
pub fn http_descriptor(id: &str) -> ServerDescriptor {
    ServerDescriptor {
        id: id.to_string(),
        transport: TransportConfig::StreamableHttp {
            url: format!("http://localhost/{id}/mcp/"),
            headers: HashMap::new(),
        },
        required_env: Vec::new(),
        connect_timeout_secs: None,
    }
}

/// Start a client over fake servers and return it with its first catalog.
pub async fn catalog_with(servers: &[(&str, FakeServer)]) -> (McpClient, Arc<CatalogSnapshot>) {
    let mut connector = FakeConnector::new();
    for (id, server) in servers {
        connector = connector.with_server(id, server.clone());
    }
    let descriptors = servers.iter().map(|(id, _)| http_descriptor(id)).collect();
    let settings = ClientSettings {
        retry: RetryPolicy {
            max_attempts: 1,
            backoff_base: Duration::from_millis(10),
            connect_timeout: Duration::from_secs(5),
        },
        manifest_timeout: Duration::from_secs(5),
        collision_policy: CollisionPolicy::Namespace,
    };
    let client = McpClient::with_connector(descriptors, settings, Arc::new(connector));
    client.start_all().await.expect("fake catalog build");
    let catalog = client.catalog();
    (client, catalog)
}

// ─── FakeServer ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeState {
    tools: Vec<(String, Value)>,
    page_size: Option<usize>,
    hang_initialize: bool,
    hang_close: bool,
    fail_tools_list: bool,
    slow: HashMap<String, Duration>,
    failing: HashMap<String, String>,
    flaky: HashMap<String, u32>,
    calls: Vec<(String, Value)>,
}

/// Scriptable MCP server. Clones share state.
#[derive(Clone, Default)]
pub struct FakeServer {
    state: Arc<Mutex<FakeState>>,
    fail_opens: Arc<AtomicU32>,
    broken: Arc<AtomicBool>,
    closes: Arc<AtomicUsize>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Export `name` with string-typed `required` fields.
    pub fn tool(self, name: &str, required: &[&str]) -> Self {
        let properties: serde_json::Map<String, Value> = required
            .iter()
            .map(|field| (field.to_string(), json!({"type": "string"})))
            .collect();
        let schema = json!({
            "type": "object",
            "properties": properties,
            "required": required,
        });
        self.state.lock().unwrap().tools.push((name.to_string(), schema));
        self
    }

    /// Refuse the first `n` connection attempts.
    pub fn fail_opens(self, n: u32) -> Self {
        self.fail_opens.store(n, Ordering::SeqCst);
        self
    }

    /// Never answer `initialize`.
    pub fn hang_initialize(self) -> Self {
        self.state.lock().unwrap().hang_initialize = true;
        self
    }

    /// Never finish closing a transport.
    pub fn hang_close(self) -> Self {
        self.state.lock().unwrap().hang_close = true;
        self
    }

    /// Serve `tools/list` in pages of `page_size`.
    pub fn paginate(self, page_size: usize) -> Self {
        self.state.lock().unwrap().page_size = Some(page_size);
        self
    }

    /// Answer `tools/list` with an internal error.
    pub fn fail_tools_list(self) -> Self {
        self.state.lock().unwrap().fail_tools_list = true;
        self
    }

    /// Delay every call to `name` by `delay`.
    pub fn slow_tool(self, name: &str, delay: Duration) -> Self {
        self.state.lock().unwrap().slow.insert(name.to_string(), delay);
        self
    }

    /// Answer calls to `name` with `isError: true` and `message`.
    pub fn failing_tool(self, name: &str, message: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .failing
            .insert(name.to_string(), message.to_string());
        self
    }

    /// Fail the first `n` calls to `name` with a JSON-RPC internal error.
    pub fn flaky_tool(self, name: &str, n: u32) -> Self {
        self.state.lock().unwrap().flaky.insert(name.to_string(), n);
        self
    }

    /// Make every live transport fail from now on.
    pub fn break_transport(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    /// Let new and existing transports work again.
    pub fn repair_transport(&self) {
        self.broken.store(false, Ordering::SeqCst);
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// `(remote tool name, arguments)` of every `tools/call`, in order.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    fn take_open_failure(&self) -> bool {
        self.fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn list_page(&self, cursor: Option<&str>) -> Value {
        let state = self.state.lock().unwrap();
        let tools: Vec<Value> = state
            .tools
            .iter()
            .map(|(name, schema)| {
                json!({"name": name, "description": format!("{name} tool"), "inputSchema": schema})
            })
            .collect();

        let Some(size) = state.page_size else {
            return json!({ "tools": tools });
        };
        let start: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let end = (start + size).min(tools.len());
        let mut page = json!({ "tools": tools[start..end].to_vec() });
        if end < tools.len() {
            page["nextCursor"] = json!(end.to_string());
        }
        page
    }

    async fn call(&self, params: Option<Value>) -> JsonRpcResponse {
        let params = params.unwrap_or_default();
        let name = params["name"].as_str().unwrap_or_default().to_string();
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        let (known, delay, failing, flaky) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push((name.clone(), arguments.clone()));
            let known = state.tools.iter().any(|(n, _)| *n == name);
            let delay = state.slow.get(&name).copied();
            let failing = state.failing.get(&name).cloned();
            let flaky = match state.flaky.get_mut(&name) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            };
            (known, delay, failing, flaky)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let id = next_request_id();
        if !known {
            return JsonRpcResponse::failure(id, error_codes::INVALID_PARAMS, &format!("Unknown tool: {name}"));
        }
        if flaky {
            return JsonRpcResponse::failure(id, error_codes::INTERNAL_ERROR, "temporary failure");
        }
        if let Some(message) = failing {
            return JsonRpcResponse::success(
                id,
                json!({"content": [{"type": "text", "text": message}], "isError": true}),
            );
        }
        JsonRpcResponse::success(
            id,
            json!({
                "content": [{"type": "text", "text": format!("{name} ok: {arguments}")}],
                "isError": false
            }),
        )
    }
}

/// One live "connection" to a `FakeServer`.
struct FakeTransport {
    server_id: String,
    server: FakeServer,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse, McpError> {
        if self.closed.load(Ordering::SeqCst) || self.server.broken.load(Ordering::SeqCst) {
            return Err(McpError::TransportError {
                server: self.server_id.clone(),
                reason: "broken pipe".into(),
            });
        }

        let id = next_request_id();
        match method {
            "initialize" => {
                let hang = self.server.state.lock().unwrap().hang_initialize;
                if hang {
                    std::future::pending::<()>().await;
                }
                Ok(JsonRpcResponse::success(
                    id,
                    json!({
                        "protocolVersion": crate::mcp_client::types::PROTOCOL_VERSION,
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": format!("fake-{}", self.server_id), "version": "1.0"}
                    }),
                ))
            }
            "tools/list" => {
                let fail = self.server.state.lock().unwrap().fail_tools_list;
                if fail {
                    return Ok(JsonRpcResponse::failure(id, error_codes::INTERNAL_ERROR, "manifest unavailable"));
                }
                let cursor = params
                    .as_ref()
                    .and_then(|p| p.get("cursor"))
                    .and_then(|c| c.as_str());
                Ok(JsonRpcResponse::success(id, self.server.list_page(cursor)))
            }
            "tools/call" => Ok(self.server.call(params).await),
            other => Ok(JsonRpcResponse::failure(
                id,
                error_codes::METHOD_NOT_FOUND,
                &format!("Method not found: {other}"),
            )),
        }
    }

    async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<(), McpError> {
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.server.closes.fetch_add(1, Ordering::SeqCst);
        }
        let hang = self.server.state.lock().unwrap().hang_close;
        if hang {
            std::future::pending::<()>().await;
        }
    }
}

// ─── FakeConnector ──────────────────────────────────────────────────────────

/// Connector over a fixed set of fake servers. Unknown ids are unreachable.
#[derive(Default)]
pub struct FakeConnector {
    servers: HashMap<String, FakeServer>,
    opens: Mutex<HashMap<String, usize>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server(mut self, id: &str, server: FakeServer) -> Self {
        self.servers.insert(id.to_string(), server);
        self
    }

    /// Connection attempts made for `id`.
    pub fn open_count(&self, id: &str) -> usize {
        self.opens.lock().unwrap().get(id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, descriptor: &ServerDescriptor) -> Result<Arc<dyn Transport>, McpError> {
        *self.opens.lock().unwrap().entry(descriptor.id.clone()).or_default() += 1;

        let refused = || McpError::TransportError {
            server: descriptor.id.clone(),
            reason: "connection refused".into(),
        };
        let server = self.servers.get(&descriptor.id).ok_or_else(refused)?;
        if server.take_open_failure() {
            return Err(refused());
        }
        Ok(Arc::new(FakeTransport {
            server_id: descriptor.id.clone(),
            server: server.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

// ─── ScriptedEngine ─────────────────────────────────────────────────────────

/// Engine that replays queued decisions, then repeats a fallback.
#[derive(Default)]
pub struct ScriptedEngine {
    script: Mutex<VecDeque<Result<EngineDecision, InferenceError>>>,
    repeat: Option<EngineDecision>,
    decisions: AtomicUsize,
    transcript_lengths: Mutex<Vec<usize>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, decision: Result<EngineDecision, InferenceError>) -> Self {
        self.script.lock().unwrap().push_back(decision);
        self
    }

    pub fn then_answer(self, text: &str) -> Self {
        self.push(Ok(EngineDecision::FinalAnswer(text.to_string())))
    }

    pub fn then_call(self, name: &str, arguments: Value) -> Self {
        self.then_calls(vec![(name, arguments)])
    }

    /// Several calls in one decision.
    pub fn then_calls(self, calls: Vec<(&str, Value)>) -> Self {
        let requests = calls
            .into_iter()
            .enumerate()
            .map(|(i, (name, args))| ToolCallRequest::new(format!("call_{i}"), name, args))
            .collect();
        self.push(Ok(EngineDecision::ToolCalls(requests)))
    }

    pub fn then_fail(self, reason: &str) -> Self {
        self.push(Err(InferenceError::ConnectionFailed {
            endpoint: "scripted".into(),
            reason: reason.to_string(),
        }))
    }

    /// Once the script runs out, request this call forever.
    pub fn always_call(mut self, name: &str, arguments: Value) -> Self {
        self.repeat = Some(EngineDecision::ToolCalls(vec![ToolCallRequest::new(
            "call_0", name, arguments,
        )]));
        self
    }

    pub fn decide_count(&self) -> usize {
        self.decisions.load(Ordering::SeqCst)
    }

    /// Transcript length seen at each decision.
    pub fn transcript_lengths(&self) -> Vec<usize> {
        self.transcript_lengths.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReasoningEngine for ScriptedEngine {
    async fn decide(
        &self,
        session: &Session,
        _catalog: &CatalogSnapshot,
    ) -> Result<EngineDecision, InferenceError> {
        self.decisions.fetch_add(1, Ordering::SeqCst);
        self.transcript_lengths
            .lock()
            .unwrap()
            .push(session.transcript().len());

        if let Some(next) = self.script.lock().unwrap().pop_front() {
            return next;
        }
        Ok(self
            .repeat
            .clone()
            .unwrap_or_else(|| EngineDecision::FinalAnswer("done".into())))
    }
}

// ─── RecordingObserver ──────────────────────────────────────────────────────

/// Observer that records what the loop reported.
#[derive(Default)]
pub struct RecordingObserver {
    states: AtomicUsize,
    calls: Mutex<Vec<String>>,
    results: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub fn states(&self) -> usize {
        self.states.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn results(&self) -> Vec<String> {
        self.results.lock().unwrap().clone()
    }
}

impl LoopObserver for RecordingObserver {
    fn on_state(&self, _session_id: &str, _state: &LoopState) {
        self.states.fetch_add(1, Ordering::SeqCst);
    }

    fn on_tool_call(&self, request: &ToolCallRequest) {
        self.calls.lock().unwrap().push(request.name.clone());
    }

    fn on_tool_result(&self, _result: &ToolCallResult, observation: &str) {
        self.results.lock().unwrap().push(observation.to_string());
    }
}
