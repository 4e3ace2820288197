//! Agent Core: the reason/act loop over MCP tools.
//!
//! Submodules:
//! - `engine`: The `ReasoningEngine` seam the loop consults each step
//! - `agent_loop`: State machine driving one session to a terminal outcome
//! - `tool_router`: Dispatcher from engine tool calls to MCP servers
//! - `session`: Sessions, cancellation handles and in-memory conversation history
//! - `types`: Shared types across the agent core
//! - `errors`: Agent-level error types

pub mod agent_loop;
pub mod engine;
pub mod errors;
pub mod session;
pub mod tool_router;
pub mod types;

// Re-exports for convenience
pub use agent_loop::{AgentLoop, LoopObserver, LoopSettings};
pub use engine::{EngineDecision, ReasoningEngine};
pub use errors::AgentError;
pub use session::{Session, SessionHandle, SessionTracker};
pub use tool_router::Dispatcher;
pub use types::{AgentOutcome, Exchange, LoopState, TranscriptEntry};
