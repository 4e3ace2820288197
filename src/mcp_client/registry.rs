//! Tool aggregation across all MCP servers.
//!
//! Provides:
//! - Manifest fetching (`tools/list` with cursor pagination) per connection
//! - Concurrent catalog construction over every Ready connection
//! - Deterministic name-collision resolution
//! - Lookup, argument validation and "did you mean" suggestions
//! - A compact capability summary for the system prompt
//!
//! A `CatalogSnapshot` is immutable. Rebuilding produces a new snapshot.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};

use super::errors::McpError;
use super::lifecycle::Connection;
use super::schema::validate_arguments;
use super::types::{ListToolsResult, ToolCallRequest};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Separator between server id and tool name for namespaced tools.
pub const NAMESPACE_SEPARATOR: &str = "__";

/// Upper bound on `tools/list` pages fetched from one server.
const MAX_MANIFEST_PAGES: usize = 64;

/// Minimum similarity for a tool to be offered as a suggestion.
const SUGGESTION_FLOOR: f64 = 0.3;

// ─── Types ───────────────────────────────────────────────────────────────────

/// What to do when two servers export the same tool name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// First server (descriptor order) keeps the bare name; later ones are
    /// renamed `{server_id}__{tool}`.
    #[default]
    Namespace,
    /// Any collision fails the catalog build.
    Reject,
}

/// One tool in the catalog.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    /// Name unique within the catalog.
    pub name: String,
    /// Name the owning server knows the tool by.
    pub remote_name: String,
    pub server_id: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub connection: Arc<Connection>,
}

impl ToolDescriptor {
    /// Whether the tool was renamed to resolve a collision.
    pub fn is_namespaced(&self) -> bool {
        self.name != self.remote_name
    }
}

/// Immutable view of every tool reachable at build time.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    tools: Vec<ToolDescriptor>,
    index: HashMap<String, usize>,
    servers: Vec<String>,
    generation: u64,
    built_at: DateTime<Utc>,
}

impl fmt::Display for CatalogSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "catalog #{} ({} tools from {} servers)",
            self.generation,
            self.tools.len(),
            self.servers.len()
        )
    }
}

impl CatalogSnapshot {
    /// A catalog with no tools.
    pub fn empty() -> Self {
        Self {
            tools: Vec::new(),
            index: HashMap::new(),
            servers: Vec::new(),
            generation: 0,
            built_at: Utc::now(),
        }
    }

    fn from_tools(tools: Vec<ToolDescriptor>, generation: u64) -> Self {
        let index = tools
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i))
            .collect();
        let mut servers: Vec<String> = Vec::new();
        for tool in &tools {
            if !servers.contains(&tool.server_id) {
                servers.push(tool.server_id.clone());
            }
        }
        Self {
            tools,
            index,
            servers,
            generation,
            built_at: Utc::now(),
        }
    }

    /// Look up a tool by catalog name.
    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    /// Tools in catalog order (descriptor order, then manifest order).
    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    /// Servers contributing at least one tool, in descriptor order.
    pub fn server_ids(&self) -> &[String] {
        &self.servers
    }

    pub fn tools_for_server(&self, server_id: &str) -> usize {
        self.tools.iter().filter(|t| t.server_id == server_id).count()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Build counter; increases with every rebuild.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    /// Resolve a request to its catalog entry and check its arguments.
    ///
    /// Never touches the network.
    pub fn validate_call(&self, request: &ToolCallRequest) -> Result<&ToolDescriptor, McpError> {
        let tool = self.get(&request.name).ok_or_else(|| McpError::UnknownTool {
            name: request.name.clone(),
            suggestions: self.find_similar(&request.name, 3),
        })?;
        validate_arguments(&tool.name, &tool.input_schema, &request.arguments)?;
        Ok(tool)
    }

    /// Up to `max_results` catalog names most similar to `name`.
    ///
    /// Namespaced names are compared on their tool part.
    pub fn find_similar(&self, name: &str, max_results: usize) -> Vec<String> {
        let query = strip_namespace(name);

        let mut scored: Vec<(&str, f64)> = self
            .tools
            .iter()
            .map(|t| (t.name.as_str(), similarity(query, strip_namespace(&t.name))))
            .filter(|(_, score)| *score > SUGGESTION_FLOOR)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(max_results);
        scored.into_iter().map(|(n, _)| n.to_string()).collect()
    }

    /// Compact description of the catalog for the system prompt.
    pub fn capability_summary(&self) -> String {
        if self.is_empty() {
            return "No tools are currently available. Answer from your own knowledge.".to_string();
        }

        let parts: Vec<String> = self
            .servers
            .iter()
            .map(|id| format!("{id} ({})", self.tools_for_server(id)))
            .collect();

        format!(
            "Available tools: {} across {} servers: {}.",
            self.len(),
            self.servers.len(),
            parts.join(", ")
        )
    }

    /// Serialize the catalog into OpenAI function-calling format.
    ///
    /// Used to populate the `tools` field in chat completion requests.
    pub fn to_openai_tools(&self) -> Vec<serde_json::Value> {
        self.tools
            .iter()
            .map(|t| {
                let description = if t.is_namespaced() {
                    format!("[{}] {}", t.server_id, t.description)
                } else {
                    t.description.clone()
                };
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect()
    }
}

fn strip_namespace(name: &str) -> &str {
    name.split_once(NAMESPACE_SEPARATOR)
        .map(|(_, tool)| tool)
        .unwrap_or(name)
}

// ─── Manifest Fetching ───────────────────────────────────────────────────────

/// Fetch one server's tool manifest, following pagination.
///
/// Returned descriptors carry the server-side name as `name`.
pub async fn list_tools(
    connection: &Arc<Connection>,
    timeout: Duration,
) -> Result<Vec<ToolDescriptor>, McpError> {
    let fetch = async {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_MANIFEST_PAGES {
            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
            let result = connection.request("tools/list", params).await?;
            let page: ListToolsResult =
                serde_json::from_value(result).map_err(|e| McpError::TransportError {
                    server: connection.id().to_string(),
                    reason: format!("malformed tools/list result: {e}"),
                })?;

            tools.extend(page.tools.into_iter().map(|def| ToolDescriptor {
                name: def.name.clone(),
                remote_name: def.name,
                server_id: connection.id().to_string(),
                description: def.description.unwrap_or_default(),
                input_schema: def.input_schema,
                connection: Arc::clone(connection),
            }));

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }

        tracing::warn!(server = %connection.id(), pages = MAX_MANIFEST_PAGES, "manifest pagination cut off");
        Ok(tools)
    };

    tokio::time::timeout(timeout, fetch)
        .await
        .map_err(|_| McpError::Timeout {
            tool: format!("{}:tools/list", connection.id()),
            timeout_ms: timeout.as_millis() as u64,
        })?
}

// ─── Catalog Construction ────────────────────────────────────────────────────

/// Build a catalog from every Ready connection.
///
/// Manifests are fetched concurrently and merged in `connections` order. A
/// server whose manifest cannot be fetched is marked Degraded and left out.
/// Only a collision under `CollisionPolicy::Reject` fails the build.
pub async fn build_catalog(
    connections: &[Arc<Connection>],
    policy: CollisionPolicy,
    manifest_timeout: Duration,
    generation: u64,
) -> Result<CatalogSnapshot, McpError> {
    let ready: Vec<&Arc<Connection>> = connections.iter().filter(|c| c.is_ready()).collect();

    let results = join_all(ready.iter().map(|c| list_tools(c, manifest_timeout))).await;

    let mut manifests = Vec::with_capacity(ready.len());
    for (connection, result) in ready.into_iter().zip(results) {
        match result {
            Ok(tools) => {
                tracing::debug!(server = %connection.id(), tools = tools.len(), "manifest fetched");
                manifests.push(tools);
            }
            Err(e) => {
                connection.mark_degraded(format!("manifest fetch failed: {e}"));
            }
        }
    }

    let tools = merge_manifests(manifests, policy)?;
    let snapshot = CatalogSnapshot::from_tools(tools, generation);
    tracing::info!(
        generation,
        tools = snapshot.len(),
        servers = snapshot.server_ids().len(),
        "tool catalog built"
    );
    Ok(snapshot)
}

/// Merge per-server manifests (already in descriptor order) into one namespace.
pub fn merge_manifests(
    manifests: Vec<Vec<ToolDescriptor>>,
    policy: CollisionPolicy,
) -> Result<Vec<ToolDescriptor>, McpError> {
    let mut merged: Vec<ToolDescriptor> = Vec::new();
    let mut owners: HashMap<String, String> = HashMap::new();

    for manifest in manifests {
        for mut tool in manifest {
            let Some(first) = owners.get(&tool.name).cloned() else {
                owners.insert(tool.name.clone(), tool.server_id.clone());
                merged.push(tool);
                continue;
            };

            if first == tool.server_id {
                tracing::warn!(server = %tool.server_id, tool = %tool.name, "duplicate tool in one manifest, keeping the first");
                continue;
            }

            if policy == CollisionPolicy::Reject {
                return Err(McpError::ToolCollision {
                    tool: tool.name,
                    first,
                    second: tool.server_id,
                });
            }

            let renamed = format!("{}{NAMESPACE_SEPARATOR}{}", tool.server_id, tool.remote_name);
            if owners.contains_key(&renamed) {
                tracing::warn!(
                    server = %tool.server_id,
                    tool = %tool.name,
                    renamed = %renamed,
                    "namespaced name still collides, dropping tool"
                );
                continue;
            }

            tracing::warn!(
                tool = %tool.name,
                kept_by = %first,
                server = %tool.server_id,
                renamed = %renamed,
                "tool name collision resolved by namespacing"
            );
            owners.insert(renamed.clone(), tool.server_id.clone());
            tool.name = renamed;
            merged.push(tool);
        }
    }

    Ok(merged)
}

// ─── Edit Distance ──────────────────────────────────────────────────────────

/// Compute the Levenshtein edit distance between two strings.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let n = b.len();

    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=n {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}

/// Normalized similarity (0.0 = completely different, 1.0 = identical).
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
