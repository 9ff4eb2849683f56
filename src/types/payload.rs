//! Payload representation passed between the engine, serializers and senders.

use serde_json::Value;

use crate::error::{Result, SenderError};

/// A payload on its way to a broker.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Textual payload, sent as UTF-8
    Text(String),
    /// Raw bytes, usually produced by a serializer
    Binary(Vec<u8>),
    /// Structured payload, JSON-encoded when it hits the wire
    Json(Value),
}

impl Payload {
    /// Wrap a decoded request payload. JSON strings become [`Payload::Text`].
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(s) => Payload::Text(s),
            other => Payload::Json(other),
        }
    }

    /// Bytes for the wire. Structured payloads are JSON-encoded.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            Payload::Text(s) => Ok(s.into_bytes()),
            Payload::Binary(b) => Ok(b),
            Payload::Json(v) => serde_json::to_vec(&v)
                .map_err(|e| SenderError::Serialization(e.to_string())),
        }
    }

    /// Size in bytes, for logging.
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(s) => s.len(),
            Payload::Binary(b) => b.len(),
            Payload::Json(v) => v.to_string().len(),
        }
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_string_value_becomes_text() {
        assert_eq!(Payload::from_value(json!("hello")), Payload::Text("hello".into()));
        assert_eq!(Payload::from_value(json!({"a": 1})), Payload::Json(json!({"a": 1})));
    }

    #[test]
    fn test_json_payload_is_encoded() {
        let bytes = Payload::from_value(json!({"a": 1})).into_bytes().unwrap();
        assert_eq!(bytes, br#"{"a":1}"#.to_vec());
    }
}
