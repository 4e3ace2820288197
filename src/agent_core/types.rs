//! Shared types for the agent core.
//!
//! Transcript entries, loop states and outcomes, and the completed
//! exchanges kept by the session tracker.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::mcp_client::types::{ToolCallRequest, ToolCallResult};

// ─── Transcript ─────────────────────────────────────────────────────────────

/// One entry in a session transcript. Append-only, in order of occurrence.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TranscriptEntry {
    /// The user's prompt that opened the session.
    Prompt { text: String },
    /// Tool calls the engine requested at `step`.
    Action {
        step: u32,
        requests: Vec<ToolCallRequest>,
    },
    /// Result of one call from the Action at the same `step`.
    Observation { step: u32, result: ToolCallResult },
    FinalAnswer { text: String },
}

impl TranscriptEntry {
    pub fn kind(&self) -> &'static str {
        match self {
            TranscriptEntry::Prompt { .. } => "prompt",
            TranscriptEntry::Action { .. } => "action",
            TranscriptEntry::Observation { .. } => "observation",
            TranscriptEntry::FinalAnswer { .. } => "final_answer",
        }
    }
}

// ─── Loop State ─────────────────────────────────────────────────────────────

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AgentOutcome {
    /// The engine produced a final answer.
    Completed { answer: String },
    /// The engine still wanted tools after the last allowed step.
    MaxStepsExceeded { steps: u32 },
    TimeBudgetExceeded { elapsed_secs: u64 },
    /// The engine failed; the partial transcript is kept.
    Failed { reason: String },
    Cancelled,
}

impl AgentOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, AgentOutcome::Completed { .. })
    }

    pub fn answer(&self) -> Option<&str> {
        match self {
            AgentOutcome::Completed { answer } => Some(answer),
            _ => None,
        }
    }

    /// Text shown to the user when the session ends.
    pub fn user_message(&self) -> String {
        match self {
            AgentOutcome::Completed { answer } => answer.clone(),
            AgentOutcome::MaxStepsExceeded { steps } => format!(
                "I stopped after {steps} tool steps without reaching an answer. \
                 Try a more specific question or raise agent.max_steps."
            ),
            AgentOutcome::TimeBudgetExceeded { elapsed_secs } => {
                format!("I ran out of time after {elapsed_secs}s before reaching an answer.")
            }
            AgentOutcome::Failed { reason } => format!("The reasoning engine failed: {reason}"),
            AgentOutcome::Cancelled => "Interrupted.".to_string(),
        }
    }
}

/// Agent loop state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopState {
    AwaitingModel,
    AwaitingTool(Vec<ToolCallRequest>),
    Terminated(AgentOutcome),
}

// ─── Exchanges ──────────────────────────────────────────────────────────────

/// A completed prompt/answer pair carried into later sessions as context.
#[derive(Debug, Clone, Serialize)]
pub struct Exchange {
    pub prompt: String,
    pub answer: String,
    pub completed_at: DateTime<Utc>,
}

// ─── Tests ──────────────────────────────────────────────────────────────────
