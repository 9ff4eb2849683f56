//! Session store for tracking per-session dispatch state.

use std::collections::HashMap;

use crate::types::SessionState;

/// In-memory session store. Entries live as long as the process.
pub struct SessionStore {
    sessions: HashMap<String, SessionState>,
}

impl SessionStore {
    /// Create a new session store.
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    /// Record a state for the session, creating it on first sight.
    ///
    /// Every message overwrites the previous state, including a payload
    /// arriving after the session already completed or failed. Returns the
    /// previous state.
    pub fn set_state(&mut self, session_id: &str, state: SessionState) -> Option<SessionState> {
        self.sessions.insert(session_id.to_string(), state)
    }

    /// Current state of a session.
    pub fn get_state(&self, session_id: &str) -> Option<SessionState> {
        self.sessions.get(session_id).copied()
    }

    /// Whether the session's last observed state is running.
    pub fn is_running(&self, session_id: &str) -> bool {
        self.get_state(session_id) == Some(SessionState::Running)
    }

    /// Number of known sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session has been seen yet.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_message_creates_session() {
        let mut store = SessionStore::new();
        assert!(store.is_empty());
        assert_eq!(store.set_state("s1", SessionState::Running), None);
        assert!(store.is_running("s1"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_terminal_state_is_overwritten_by_late_payload() {
        let mut store = SessionStore::new();
        store.set_state("s1", SessionState::Running);
        assert_eq!(
            store.set_state("s1", SessionState::Completed),
            Some(SessionState::Running)
        );
        assert!(!store.is_running("s1"));

        assert_eq!(
            store.set_state("s1", SessionState::Running),
            Some(SessionState::Completed)
        );
        assert!(store.is_running("s1"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_sessions_are_independent() {
        let mut store = SessionStore::new();
        store.set_state("a", SessionState::Running);
        store.set_state("b", SessionState::Failed);

        assert!(store.is_running("a"));
        assert_eq!(store.get_state("b"), Some(SessionState::Failed));
        assert_eq!(store.get_state("c"), None);
        assert_eq!(store.len(), 2);
    }
}
