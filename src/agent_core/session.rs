//! Session tracking.
//!
//! A `Session` is one prompt's run through the agent loop: an append-only
//! transcript, a bounded step counter and a cancellation signal. The
//! `SessionTracker` hands out sessions under one conversation id and keeps
//! completed prompt/answer exchanges in memory so later sessions see them
//! as context. Nothing survives a process restart.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use super::errors::AgentError;
use super::types::{AgentOutcome, Exchange, TranscriptEntry};

/// Completed exchanges carried forward as context. Older ones are dropped.
const MAX_HISTORY_EXCHANGES: usize = 20;

// ─── Session ────────────────────────────────────────────────────────────────

/// Cancels a running session from another task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session_id: String,
    cancel_tx: Arc<watch::Sender<bool>>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Signal cancellation. The in-flight engine or tool call is abandoned.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }
}

/// One prompt's run through the agent loop.
#[derive(Debug)]
pub struct Session {
    id: String,
    conversation_id: String,
    started_at: DateTime<Utc>,
    max_steps: u32,
    step_count: u32,
    transcript: Vec<TranscriptEntry>,
    history: Vec<Exchange>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl Session {
    /// Create a session whose transcript starts with `prompt`.
    pub fn new(
        conversation_id: &str,
        prompt: &str,
        max_steps: u32,
        history: Vec<Exchange>,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            started_at: Utc::now(),
            max_steps,
            step_count: 0,
            transcript: vec![TranscriptEntry::Prompt {
                text: prompt.to_string(),
            }],
            history,
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// The prompt that opened the session.
    pub fn prompt(&self) -> &str {
        self.transcript
            .iter()
            .find_map(|e| match e {
                TranscriptEntry::Prompt { text } => Some(text.as_str()),
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn max_steps(&self) -> u32 {
        self.max_steps
    }

    pub fn step_count(&self) -> u32 {
        self.step_count
    }

    pub fn steps_remaining(&self) -> u32 {
        self.max_steps.saturating_sub(self.step_count)
    }

    /// Count one completed tool step. Refuses to pass `max_steps`.
    pub fn advance_step(&mut self) -> bool {
        if self.step_count >= self.max_steps {
            return false;
        }
        self.step_count += 1;
        true
    }

    /// Append to the transcript.
    pub fn record(&mut self, entry: TranscriptEntry) {
        self.transcript.push(entry);
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    /// Earlier completed exchanges in this conversation, oldest first.
    pub fn history(&self) -> &[Exchange] {
        &self.history
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            session_id: self.id.clone(),
            cancel_tx: Arc::clone(&self.cancel_tx),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Resolves once the session is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            // Sender gone: cancellation can no longer happen.
            std::future::pending::<()>().await;
        }
    }
}

// ─── SessionTracker ─────────────────────────────────────────────────────────

/// Issues sessions for one user's conversation and remembers its exchanges.
pub struct SessionTracker {
    user_id: String,
    conversation_id: String,
    max_steps: u32,
    history: Mutex<Vec<Exchange>>,
    active: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionTracker {
    /// A tracker with a fresh conversation id `{user_id}-{uuid}`.
    pub fn new(user_id: &str, max_steps: u32) -> Self {
        let conversation_id = format!("{user_id}-{}", Uuid::new_v4());
        tracing::info!(user_id, conversation_id = %conversation_id, "conversation started");
        Self {
            user_id: user_id.to_string(),
            conversation_id,
            max_steps,
            history: Mutex::new(Vec::new()),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn max_steps(&self) -> u32 {
        self.max_steps
    }

    /// Start a session for `prompt` carrying the conversation's history.
    pub fn start_session(&self, prompt: &str) -> Session {
        let session = Session::new(&self.conversation_id, prompt, self.max_steps, self.history());
        if let Ok(mut active) = self.active.lock() {
            active.insert(session.id().to_string(), session.handle());
        }
        tracing::info!(
            session_id = %session.id(),
            conversation_id = %self.conversation_id,
            max_steps = self.max_steps,
            "session started"
        );
        session
    }

    /// Append `entry` to `session`'s transcript.
    pub fn record(&self, session: &mut Session, entry: TranscriptEntry) {
        tracing::debug!(session_id = %session.id(), kind = entry.kind(), "transcript entry");
        session.record(entry);
    }

    /// Finalize a session: cancel anything still in flight, keep the
    /// exchange if it completed, and discard the transcript.
    pub fn end_session(&self, session: Session, outcome: &AgentOutcome) -> Option<Exchange> {
        session.handle().cancel();
        if let Ok(mut active) = self.active.lock() {
            active.remove(session.id());
        }

        tracing::info!(
            session_id = %session.id(),
            steps = session.step_count(),
            entries = session.transcript().len(),
            outcome = ?outcome,
            "session ended"
        );

        let answer = outcome.answer()?;
        let exchange = Exchange {
            prompt: session.prompt().to_string(),
            answer: answer.to_string(),
            completed_at: Utc::now(),
        };
        if let Ok(mut history) = self.history.lock() {
            history.push(exchange.clone());
            let overflow = history.len().saturating_sub(MAX_HISTORY_EXCHANGES);
            history.drain(..overflow);
        }
        Some(exchange)
    }

    /// Cancel a running session by id.
    pub fn cancel(&self, session_id: &str) -> Result<(), AgentError> {
        let active = self.active.lock().map_err(|_| AgentError::SessionNotFound {
            session_id: session_id.to_string(),
        })?;
        let handle = active.get(session_id).ok_or_else(|| AgentError::SessionNotFound {
            session_id: session_id.to_string(),
        })?;
        handle.cancel();
        tracing::info!(session_id, "session cancelled");
        Ok(())
    }

    /// Cancel every running session (shutdown).
    pub fn cancel_all(&self) {
        if let Ok(active) = self.active.lock() {
            for handle in active.values() {
                handle.cancel();
            }
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.active.lock().map(|a| a.len()).unwrap_or(0)
    }

    /// Completed exchanges, oldest first.
    pub fn history(&self) -> Vec<Exchange> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_conversation_id_has_user_prefix() {
        let tracker = SessionTracker::new("alice", 5);
        assert!(tracker.conversation_id().starts_with("alice-"));
        assert_eq!(tracker.conversation_id().len(), "alice-".len() + 36);
    }

    #[test]
    fn test_start_session_begins_with_prompt() {
        let tracker = SessionTracker::new("u", 3);
        let session = tracker.start_session("what is MCP?");
        assert_eq!(session.prompt(), "what is MCP?");
        assert_eq!(session.transcript().len(), 1);
        assert_eq!(session.transcript()[0].kind(), "prompt");
        assert_eq!(session.conversation_id(), tracker.conversation_id());
        assert_eq!(session.max_steps(), 3);
        assert_eq!(tracker.active_sessions(), 1);
    }

    #[test]
    fn test_sessions_get_distinct_ids() {
        let tracker = SessionTracker::new("u", 3);
        let a = tracker.start_session("a");
        let b = tracker.start_session("b");
        assert_ne!(a.id(), b.id());
        assert_eq!(tracker.active_sessions(), 2);
    }

    #[test]
    fn test_step_count_never_exceeds_max() {
        let mut session = Session::new("c", "p", 2, Vec::new());
        assert!(session.advance_step());
        assert!(session.advance_step());
        assert!(!session.advance_step());
        assert_eq!(session.step_count(), 2);
        assert_eq!(session.steps_remaining(), 0);
    }

    #[test]
    fn test_record_appends_in_order() {
        let tracker = SessionTracker::new("u", 3);
        let mut session = tracker.start_session("p");
        tracker.record(&mut session, TranscriptEntry::FinalAnswer { text: "a".into() });
        let kinds: Vec<&str> = session.transcript().iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["prompt", "final_answer"]);
    }

    #[test]
    fn test_end_session_keeps_completed_exchange() {
        let tracker = SessionTracker::new("u", 3);
        let session = tracker.start_session("capital of France?");
        let exchange = tracker
            .end_session(session, &AgentOutcome::Completed { answer: "Paris".into() })
            .unwrap();
        assert_eq!(exchange.answer, "Paris");
        assert_eq!(tracker.active_sessions(), 0);

        let next = tracker.start_session("and of Spain?");
        assert_eq!(next.history().len(), 1);
        assert_eq!(next.history()[0].prompt, "capital of France?");
    }

    #[test]
    fn test_end_session_without_answer_keeps_no_history() {
        let tracker = SessionTracker::new("u", 3);
        let session = tracker.start_session("loop forever");
        let handle = session.handle();
        assert!(tracker
            .end_session(session, &AgentOutcome::MaxStepsExceeded { steps: 3 })
            .is_none());
        assert!(tracker.history().is_empty());
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_history_is_capped() {
        let tracker = SessionTracker::new("u", 1);
        for i in 0..(MAX_HISTORY_EXCHANGES + 5) {
            let session = tracker.start_session(&format!("q{i}"));
            tracker.end_session(session, &AgentOutcome::Completed { answer: "a".into() });
        }
        let history = tracker.history();
        assert_eq!(history.len(), MAX_HISTORY_EXCHANGES);
        assert_eq!(history[0].prompt, "q5");
    }

    #[test]
    fn test_cancel_unknown_session() {
        let tracker = SessionTracker::new("u", 1);
        assert!(matches!(
            tracker.cancel("nope"),
            Err(AgentError::SessionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let tracker = SessionTracker::new("u", 1);
        let session = tracker.start_session("p");
        let id = session.id().to_string();
        assert!(!session.is_cancelled());

        let waiter = async {
            tokio::time::timeout(Duration::from_secs(1), session.cancelled())
                .await
                .is_ok()
        };
        let (woke, _) = tokio::join!(waiter, async { tracker.cancel(&id).unwrap() });
        assert!(woke);
        assert!(session.is_cancelled());
    }
}
