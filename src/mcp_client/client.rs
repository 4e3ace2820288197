//! MCP Client: the connection manager.
//!
//! Owns one `Connection` per configured server, connects them concurrently,
//! and publishes the current `CatalogSnapshot`. Catalog rebuilds and
//! reconnects are serialized; readers always see a complete snapshot
//! because publication is a single `Arc` swap.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::lifecycle::{Connection, ConnectionState, Connector, DefaultConnector, RetryPolicy};
use super::registry::{build_catalog, CatalogSnapshot, CollisionPolicy};
use super::types::ServerDescriptor;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default timeout for one server's `tools/list` exchange.
const DEFAULT_MANIFEST_TIMEOUT: Duration = Duration::from_secs(15);

// ─── Settings ────────────────────────────────────────────────────────────────

/// Connection manager settings.
#[derive(Debug, Clone, Copy)]
pub struct ClientSettings {
    pub retry: RetryPolicy,
    pub manifest_timeout: Duration,
    pub collision_policy: CollisionPolicy,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            manifest_timeout: DEFAULT_MANIFEST_TIMEOUT,
            collision_policy: CollisionPolicy::default(),
        }
    }
}

/// Point-in-time status of one server.
#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub id: String,
    pub transport: &'static str,
    pub target: String,
    pub state: ConnectionState,
    pub tool_count: usize,
    pub server_label: Option<String>,
    pub last_error: Option<String>,
}

// ─── McpClient ───────────────────────────────────────────────────────────────

/// High-level MCP client that manages multiple servers and their catalog.
pub struct McpClient {
    connections: Vec<Arc<Connection>>,
    connector: Arc<dyn Connector>,
    settings: ClientSettings,
    catalog: RwLock<Arc<CatalogSnapshot>>,
    /// Serializes rebuilds; holds the last generation number.
    rebuild: Mutex<u64>,
}

impl McpClient {
    /// Create a client that opens real stdio/HTTP transports.
    pub fn new(descriptors: Vec<ServerDescriptor>, settings: ClientSettings) -> Result<Self, McpError> {
        let connector = Arc::new(DefaultConnector::new()?);
        Ok(Self::with_connector(descriptors, settings, connector))
    }

    /// Create a client over a custom connector.
    pub fn with_connector(
        descriptors: Vec<ServerDescriptor>,
        settings: ClientSettings,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            connections: descriptors
                .into_iter()
                .map(|d| Arc::new(Connection::new(d)))
                .collect(),
            connector,
            settings,
            catalog: RwLock::new(Arc::new(CatalogSnapshot::empty())),
            rebuild: Mutex::new(0),
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Connect every server concurrently and build the first catalog.
    ///
    /// Returns the servers that failed to connect (partial startup is OK).
    /// Fails only when the catalog itself cannot be built (collision under
    /// the `reject` policy).
    pub async fn start_all(&self) -> Result<Vec<(String, McpError)>, McpError> {
        let mut generation = self.rebuild.lock().await;

        let failures = self.establish_many(self.connections.iter().collect()).await;
        for (id, err) in &failures {
            tracing::warn!(server = %id, error = %err, "server unavailable at startup");
        }

        self.rebuild_locked(&mut generation).await?;
        Ok(failures)
    }

    /// Retry every Degraded server and rebuild the catalog if any recovered.
    ///
    /// Returns the servers that are still unavailable.
    pub async fn reconnect_degraded(&self) -> Result<Vec<(String, McpError)>, McpError> {
        let mut generation = self.rebuild.lock().await;

        let degraded: Vec<&Arc<Connection>> = self
            .connections
            .iter()
            .filter(|c| c.state() == ConnectionState::Degraded)
            .collect();
        if degraded.is_empty() {
            return Ok(Vec::new());
        }

        let attempted = degraded.len();
        let failures = self.establish_many(degraded).await;
        if failures.len() < attempted {
            tracing::info!(recovered = attempted - failures.len(), "degraded servers recovered");
            self.rebuild_locked(&mut generation).await?;
        }
        Ok(failures)
    }

    /// Rebuild the catalog from the current Ready connections.
    pub async fn rebuild_catalog(&self) -> Result<Arc<CatalogSnapshot>, McpError> {
        let mut generation = self.rebuild.lock().await;
        self.rebuild_locked(&mut generation).await
    }

    async fn rebuild_locked(&self, generation: &mut u64) -> Result<Arc<CatalogSnapshot>, McpError> {
        *generation += 1;
        let snapshot = Arc::new(
            build_catalog(
                &self.connections,
                self.settings.collision_policy,
                self.settings.manifest_timeout,
                *generation,
            )
            .await?,
        );
        self.publish(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    fn publish(&self, snapshot: Arc<CatalogSnapshot>) {
        match self.catalog.write() {
            Ok(mut slot) => *slot = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }

    async fn establish_many(&self, connections: Vec<&Arc<Connection>>) -> Vec<(String, McpError)> {
        let retry = self.settings.retry;
        let connector = self.connector.as_ref();
        let results = join_all(
            connections
                .iter()
                .map(|c| async move { (c.id().to_string(), c.establish(connector, &retry).await) }),
        )
        .await;

        results
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|e| (id, e)))
            .collect()
    }

    /// Periodically reconnect Degraded servers in the background.
    pub fn spawn_supervisor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match client.reconnect_degraded().await {
                    Ok(still_down) if !still_down.is_empty() => {
                        tracing::debug!(count = still_down.len(), "servers still degraded");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "catalog rebuild failed during reconnect"),
                }
            }
        })
    }

    /// Close every connection and publish an empty catalog.
    pub async fn shutdown_all(&self) {
        let _guard = self.rebuild.lock().await;
        join_all(self.connections.iter().map(|c| c.close())).await;
        self.publish(Arc::new(CatalogSnapshot::empty()));
        tracing::info!(servers = self.connections.len(), "all connections closed");
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// The current catalog. Cheap; the snapshot is shared.
    pub fn catalog(&self) -> Arc<CatalogSnapshot> {
        match self.catalog.read() {
            Ok(slot) => Arc::clone(&slot),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn connection(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.iter().find(|c| c.id() == id).cloned()
    }

    /// Status of every configured server, in descriptor order.
    pub fn server_statuses(&self) -> Vec<ServerStatus> {
        let catalog = self.catalog();
        self.connections
            .iter()
            .map(|c| ServerStatus {
                id: c.id().to_string(),
                transport: c.descriptor().transport.kind(),
                target: c.descriptor().transport.target(),
                state: c.state(),
                tool_count: catalog.tools_for_server(c.id()),
                server_label: c.server_label(),
                last_error: c.last_error(),
            })
            .collect()
    }

    pub fn ready_server_count(&self) -> usize {
        self.connections.iter().filter(|c| c.is_ready()).count()
    }

    pub fn configured_server_count(&self) -> usize {
        self.connections.len()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
