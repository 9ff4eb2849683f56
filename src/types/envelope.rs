//! Feedback envelopes published back to the control broker.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    /// A payload reached its broker
    Confirmation,
    /// A payload could not be delivered
    Error,
}

/// Confirmation or error report for one session message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackEnvelope {
    #[serde(rename = "type")]
    pub kind: FeedbackKind,
    pub session_id: String,
    /// The delivered payload, or the error text
    pub message: Value,
    /// Epoch milliseconds
    pub timestamp: i64,
}

impl FeedbackEnvelope {
    /// Confirmation carrying the payload as it arrived on the control queue.
    pub fn confirmation(session_id: &str, payload: &Value) -> Self {
        Self {
            kind: FeedbackKind::Confirmation,
            session_id: session_id.to_string(),
            message: payload.clone(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Error report carrying the error text.
    pub fn error(session_id: &str, error: &str) -> Self {
        Self {
            kind: FeedbackKind::Error,
            session_id: session_id.to_string(),
            message: Value::String(error.to_string()),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Routing key on the feedback exchange.
    pub fn routing_key(&self) -> String {
        match self.kind {
            FeedbackKind::Confirmation => format!("sessions.{}.payload", self.session_id),
            FeedbackKind::Error => format!("sessions.{}.errors", self.session_id),
        }
    }

    /// JSON body.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
