//! MCP Client: connections to tool servers and the merged tool catalog.
//!
//! This module handles:
//! - Stdio and streamable HTTP transports speaking JSON-RPC 2.0
//! - Connection lifecycle (handshake, bounded retry with backoff, Degraded, Closed)
//! - Tool discovery and the immutable, versioned catalog snapshot
//! - Argument validation against each tool's input schema
//!
//! The agent loop reaches servers only through the catalog; the dispatcher
//! in `agent_core::tool_router` routes each call to the owning connection.

pub mod client;
pub mod errors;
pub mod http;
pub mod lifecycle;
pub mod registry;
pub mod schema;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use client::{ClientSettings, McpClient, ServerStatus};
pub use errors::McpError;
pub use lifecycle::{Connection, ConnectionState, Connector, RetryPolicy};
pub use registry::{CatalogSnapshot, CollisionPolicy, ToolDescriptor};
pub use types::{ServerDescriptor, ToolCallRequest, ToolCallResult, ToolErrorKind, TransportConfig};
