//! Agent Core error types.

use thiserror::Error;

/// Errors that can occur during agent core operations.
///
/// Engine and tool failures never surface here: the loop turns them into
/// observations or a terminal `AgentOutcome`.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Session not found in the tracker.
    #[error("session not found: '{session_id}'")]
    SessionNotFound { session_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_not_found_names_session() {
        let err = AgentError::SessionNotFound {
            session_id: "guest-1".into(),
        };
        assert_eq!(err.to_string(), "session not found: 'guest-1'");
    }
}
