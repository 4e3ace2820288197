//! The agent loop: a reason/act state machine over one session.
//!
//! `AwaitingModel → AwaitingTool → AwaitingModel → … → Terminated`.
//! Every engine call and tool dispatch races the session's cancellation
//! signal and the time budget; whichever fires first wins and the loser's
//! future is dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

use crate::mcp_client::registry::CatalogSnapshot;
use crate::mcp_client::types::{ToolCallRequest, ToolCallResult, ToolErrorKind};

use super::engine::{EngineDecision, ReasoningEngine};
use super::session::Session;
use super::tool_router::Dispatcher;
use super::types::{AgentOutcome, LoopState, TranscriptEntry};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Default wall-clock budget for one session.
pub const DEFAULT_TIME_BUDGET: Duration = Duration::from_secs(300);

/// Default cap on observation text fed back to the engine.
pub const DEFAULT_MAX_OBSERVATION_CHARS: usize = 6000;

// ─── Observer ───────────────────────────────────────────────────────────────

/// Progress callbacks for interactive surfaces. All methods are optional.
pub trait LoopObserver: Send + Sync {
    fn on_state(&self, _session_id: &str, _state: &LoopState) {}
    fn on_tool_call(&self, _request: &ToolCallRequest) {}
    fn on_tool_result(&self, _result: &ToolCallResult, _observation: &str) {}
}

// ─── AgentLoop ──────────────────────────────────────────────────────────────

/// Loop settings.
#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub time_budget: Duration,
    pub max_observation_chars: usize,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            time_budget: DEFAULT_TIME_BUDGET,
            max_observation_chars: DEFAULT_MAX_OBSERVATION_CHARS,
        }
    }
}

/// Drives sessions through the engine and the dispatcher.
pub struct AgentLoop {
    engine: Arc<dyn ReasoningEngine>,
    dispatcher: Dispatcher,
    settings: LoopSettings,
    observer: Option<Arc<dyn LoopObserver>>,
}

impl AgentLoop {
    pub fn new(engine: Arc<dyn ReasoningEngine>, dispatcher: Dispatcher, settings: LoopSettings) -> Self {
        Self {
            engine,
            dispatcher,
            settings,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn LoopObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn settings(&self) -> LoopSettings {
        self.settings
    }

    /// Run `session` to a terminal state against `catalog`.
    ///
    /// The catalog is fixed for the whole run; rebuilds published meanwhile
    /// apply to the next session.
    pub async fn run(&self, session: &mut Session, catalog: &CatalogSnapshot) -> AgentOutcome {
        let started = Instant::now();
        let deadline = started + self.settings.time_budget;
        let mut state = LoopState::AwaitingModel;

        tracing::info!(
            session_id = %session.id(),
            conversation_id = %session.conversation_id(),
            catalog = %catalog,
            "agent loop started"
        );

        loop {
            if let Some(observer) = &self.observer {
                observer.on_state(session.id(), &state);
            }

            state = match state {
                LoopState::AwaitingModel => self.await_model(session, catalog, started, deadline).await,
                LoopState::AwaitingTool(requests) => {
                    self.await_tools(session, catalog, requests, started, deadline).await
                }
                LoopState::Terminated(outcome) => {
                    if let AgentOutcome::Completed { answer } = &outcome {
                        session.record(TranscriptEntry::FinalAnswer {
                            text: answer.clone(),
                        });
                    }
                    tracing::info!(
                        session_id = %session.id(),
                        steps = session.step_count(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        outcome = ?outcome,
                        "agent loop finished"
                    );
                    return outcome;
                }
            };
        }
    }

    async fn await_model(
        &self,
        session: &Session,
        catalog: &CatalogSnapshot,
        started: Instant,
        deadline: Instant,
    ) -> LoopState {
        let decision = tokio::select! {
            biased;
            _ = session.cancelled() => return LoopState::Terminated(AgentOutcome::Cancelled),
            _ = sleep_until(deadline) => return LoopState::Terminated(budget_exceeded(started)),
            decision = self.engine.decide(session, catalog) => decision,
        };

        match decision {
            Err(e) => {
                tracing::error!(session_id = %session.id(), error = %e, "reasoning engine failed");
                LoopState::Terminated(AgentOutcome::Failed {
                    reason: e.to_string(),
                })
            }
            Ok(EngineDecision::FinalAnswer(answer)) => {
                LoopState::Terminated(AgentOutcome::Completed { answer })
            }
            Ok(EngineDecision::ToolCalls(requests)) if requests.is_empty() => {
                LoopState::Terminated(AgentOutcome::Failed {
                    reason: "engine returned neither tool calls nor an answer".into(),
                })
            }
            Ok(EngineDecision::ToolCalls(_)) if session.step_count() >= session.max_steps() => {
                tracing::warn!(session_id = %session.id(), steps = session.step_count(), "max steps reached");
                LoopState::Terminated(AgentOutcome::MaxStepsExceeded {
                    steps: session.step_count(),
                })
            }
            Ok(EngineDecision::ToolCalls(requests)) => LoopState::AwaitingTool(assign_call_ids(requests)),
        }
    }

    async fn await_tools(
        &self,
        session: &mut Session,
        catalog: &CatalogSnapshot,
        requests: Vec<ToolCallRequest>,
        started: Instant,
        deadline: Instant,
    ) -> LoopState {
        let step = session.step_count() + 1;
        session.record(TranscriptEntry::Action {
            step,
            requests: requests.clone(),
        });
        if let Some(observer) = &self.observer {
            for request in &requests {
                observer.on_tool_call(request);
            }
        }

        let interrupted = {
            let session_ref: &Session = session;
            tokio::select! {
                biased;
                _ = session_ref.cancelled() => Err(AgentOutcome::Cancelled),
                _ = sleep_until(deadline) => Err(budget_exceeded(started)),
                results = self.dispatcher.invoke_all(&requests, catalog) => Ok(results),
            }
        };

        let (results, next) = match interrupted {
            Ok(results) => (results, LoopState::AwaitingModel),
            Err(outcome) => {
                let reason = match outcome {
                    AgentOutcome::Cancelled => "session cancelled while the call was in flight",
                    _ => "time budget exhausted while the call was in flight",
                };
                let results = requests
                    .iter()
                    .map(|r| ToolCallResult::error(r, ToolErrorKind::Cancelled, reason, 0))
                    .collect();
                (results, LoopState::Terminated(outcome))
            }
        };

        for result in results {
            let observation = result.observation_text(self.settings.max_observation_chars);
            if let Some(observer) = &self.observer {
                observer.on_tool_result(&result, &observation);
            }
            session.record(TranscriptEntry::Observation { step, result });
        }
        session.advance_step();
        next
    }
}

fn budget_exceeded(started: Instant) -> AgentOutcome {
    AgentOutcome::TimeBudgetExceeded {
        elapsed_secs: started.elapsed().as_secs(),
    }
}

/// Give every request a unique, non-empty id so results can be correlated.
fn assign_call_ids(mut requests: Vec<ToolCallRequest>) -> Vec<ToolCallRequest> {
    let mut seen = std::collections::HashSet::new();
    for request in &mut requests {
        if request.id.is_empty() || !seen.insert(request.id.clone()) {
            request.id = format!("call_{}", Uuid::new_v4());
            seen.insert(request.id.clone());
        }
    }
    requests
}

// ─── Tests ──────────────────────────────────────────────────────────────────
