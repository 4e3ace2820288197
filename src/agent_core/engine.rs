//! The reasoning engine seam.
//!
//! The agent loop asks the engine what to do next given the session so far
//! and the current catalog. `inference::InferenceClient` is the production
//! implementation.

use async_trait::async_trait;

use crate::inference::errors::InferenceError;
use crate::mcp_client::registry::CatalogSnapshot;
use crate::mcp_client::types::ToolCallRequest;

use super::session::Session;

/// What the engine wants after reading the transcript.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineDecision {
    FinalAnswer(String),
    /// One or more calls. Several calls in one decision run concurrently.
    ToolCalls(Vec<ToolCallRequest>),
}

/// Decides the next step of a session.
#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    async fn decide(
        &self,
        session: &Session,
        catalog: &CatalogSnapshot,
    ) -> Result<EngineDecision, InferenceError>;
}
