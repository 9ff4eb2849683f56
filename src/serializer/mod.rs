//! Payload and key serialization.
//!
//! The engine only relies on [`EntitySerializer`]; schema-driven formats
//! plug in behind the same trait.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, SenderError};
use crate::types::{Payload, Target};

/// What a serializer is applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializerRole {
    /// The message body, configured by `messageSerializer`
    Message,
    /// The Kafka key, configured by `keySerializer`
    Key,
}

impl SerializerRole {
    /// Name of the target field holding this role's configuration.
    pub fn field(&self) -> &'static str {
        match self {
            SerializerRole::Message => "messageSerializer",
            SerializerRole::Key => "keySerializer",
        }
    }

    fn config<'a>(&self, target: &'a Target) -> Option<&'a Value> {
        match self {
            SerializerRole::Message => target.message_serializer.as_ref(),
            SerializerRole::Key => target.key_serializer.as_ref(),
        }
    }
}

/// Turns a payload or key into its wire form.
#[async_trait]
pub trait EntitySerializer: Send + Sync {
    /// Serialize `value` according to the target's configuration for `role`.
    async fn serialize(&self, target: &Target, role: SerializerRole, value: Payload) -> Result<Payload>;
}

/// Serializer for the built-in `json` and `string` formats.
///
/// The configuration is either a bare format name or an object with a
/// `type` field, e.g. `{"type": "json"}`.
#[derive(Debug, Clone, Default)]
pub struct JsonEntitySerializer;

impl JsonEntitySerializer {
    /// Create a new serializer.
    pub fn new() -> Self {
        Self
    }

    fn format_of(config: &Value) -> Option<&str> {
        match config {
            Value::String(s) => Some(s.as_str()),
            Value::Object(map) => map.get("type").and_then(|v| v.as_str()),
            _ => None,
        }
    }
}

#[async_trait]
impl EntitySerializer for JsonEntitySerializer {
    async fn serialize(&self, target: &Target, role: SerializerRole, value: Payload) -> Result<Payload> {
        let config = role.config(target).ok_or_else(|| {
            SenderError::Serialization(format!("target has no {} configured", role.field()))
        })?;
        let format = Self::format_of(config).unwrap_or_default().to_ascii_lowercase();

        debug!(role = role.field(), format = %format, "Serializing entity");

        match format.as_str() {
            "json" => {
                let value = match value {
                    Payload::Text(s) => Value::String(s),
                    Payload::Json(v) => v,
                    Payload::Binary(_) => {
                        return Err(SenderError::Serialization(
                            "binary payloads cannot be JSON-serialized".to_string(),
                        ))
                    }
                };
                serde_json::to_vec(&value)
                    .map(Payload::Binary)
                    .map_err(|e| SenderError::Serialization(e.to_string()))
            }
            "string" | "text" => match value {
                Payload::Text(s) => Ok(Payload::Text(s)),
                Payload::Json(v) => Ok(Payload::Text(v.to_string())),
                Payload::Binary(b) => String::from_utf8(b)
                    .map(Payload::Text)
                    .map_err(|e| SenderError::Serialization(e.to_string())),
            },
            other => Err(SenderError::Serialization(format!(
                "unsupported {} type '{}'",
                role.field(),
                other
            ))),
        }
    }
}
