//! Dispatch requests read from the control queue.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::target::Target;

/// Wire value of a session-completed request.
pub const SESSION_COMPLETED: &str = "completed";

/// Wire value of a session-failed request.
pub const SESSION_FAILED: &str = "failed";

/// One unit of work from the control queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    /// Session the message belongs to
    pub session_id: String,

    /// Where the payload goes
    pub target: Target,

    /// Payload to relay; ignored for lifecycle requests
    #[serde(default)]
    pub payload: Value,

    /// Lifecycle marker; absent for ordinary payload messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl DispatchRequest {
    /// Decode a request from a raw message body.
    pub fn from_slice(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }

    /// Which lifecycle transition this request asks for.
    ///
    /// Anything other than `completed` or `failed` is a payload message.
    pub fn transition(&self) -> SessionState {
        match self.state.as_deref() {
            Some(s) if s.eq_ignore_ascii_case(SESSION_COMPLETED) => SessionState::Completed,
            Some(s) if s.eq_ignore_ascii_case(SESSION_FAILED) => SessionState::Failed,
            _ => SessionState::Running,
        }
    }
}

/// Per-session state tracked by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Payload messages are flowing
    Running,
    /// The session finished normally
    Completed,
    /// The session was aborted upstream
    Failed,
}

impl SessionState {
    /// Whether no further payloads are expected.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Running => write!(f, "running"),
            SessionState::Completed => write!(f, "completed"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}
