//! Destination descriptors and their security settings.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SenderError};

/// Delimiter separating a URL scheme from the rest of the address.
pub const URL_PROTOCOL_DELIMITER: &str = "://";

/// Destination a payload is relayed to.
///
/// Field order is part of the cache key: [`Target::canonical_key`] emits the
/// declared fields in this order, followed by any unknown fields sorted by
/// name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// Broker address, with or without a `scheme://` prefix
    pub url: String,

    /// Queue name (AMQP)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,

    /// Topic name (Kafka, MQTT)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,

    /// Security descriptor used to open the connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<SecurityDescriptor>,

    /// Serializer applied to the payload before publishing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_serializer: Option<Value>,

    /// Serializer applied to the Kafka key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_serializer: Option<Value>,

    /// Key-derivation function text (Kafka)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_function: Option<String>,

    /// Fields this service does not interpret but which still distinguish
    /// destinations
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Target {
    /// Create a target for the given URL with no other settings.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            queue: None,
            topic: None,
            security: None,
            message_serializer: None,
            key_serializer: None,
            key_function: None,
            extra: BTreeMap::new(),
        }
    }

    /// Set the queue.
    pub fn with_queue(mut self, queue: &str) -> Self {
        self.queue = Some(queue.to_string());
        self
    }

    /// Set the topic.
    pub fn with_topic(mut self, topic: &str) -> Self {
        self.topic = Some(topic.to_string());
        self
    }

    /// Set the security descriptor.
    pub fn with_security(mut self, security: SecurityDescriptor) -> Self {
        self.security = Some(security);
        self
    }

    /// Deterministic serialization used as the connection cache key.
    pub fn canonical_key(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| SenderError::Serialization(format!("cannot serialize target: {}", e)))
    }

    /// The raw security type string, if any security was configured.
    pub fn security_type(&self) -> Option<&str> {
        self.security
            .as_ref()
            .and_then(|s| s.security_type.as_deref())
    }

    /// Whether a message serializer is configured.
    pub fn has_message_serializer(&self) -> bool {
        is_configured(&self.message_serializer)
    }

    /// Whether a key serializer is configured.
    pub fn has_key_serializer(&self) -> bool {
        is_configured(&self.key_serializer)
    }

    /// The queue, or an error naming the target.
    pub fn require_queue(&self) -> Result<&str> {
        self.queue.as_deref().ok_or_else(|| SenderError::MissingDestination {
            url: self.url.clone(),
            field: "queue",
        })
    }

    /// The topic, or an error naming the target.
    pub fn require_topic(&self) -> Result<&str> {
        self.topic.as_deref().ok_or_else(|| SenderError::MissingDestination {
            url: self.url.clone(),
            field: "topic",
        })
    }
}

fn is_configured(value: &Option<Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

/// Abstract security settings, discriminated by `type`.
///
/// The descriptor is kept loose on the wire: an unknown `type` still decodes
/// and is rejected by the sender that tries to use it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityDescriptor {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub security_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Base64-encoded PEM device certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_certificate: Option<String>,
    /// Base64-encoded PEM private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    /// Base64-encoded PEM CA certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
}

impl SecurityDescriptor {
    /// Username/password security.
    pub fn credentials(username: &str, password: &str) -> Self {
        Self {
            security_type: Some(SecurityType::Credentials.as_str().to_string()),
            username: Some(username.to_string()),
            password: Some(password.to_string()),
            ..Default::default()
        }
    }

    /// Certificate security from base64-encoded PEM material.
    pub fn certificate(device_certificate: &str, private_key: &str, ca: Option<&str>) -> Self {
        Self {
            security_type: Some(SecurityType::Certificate.as_str().to_string()),
            device_certificate: Some(device_certificate.to_string()),
            private_key: Some(private_key.to_string()),
            ca: ca.map(String::from),
            ..Default::default()
        }
    }

    /// Descriptor with an arbitrary type and no fields.
    pub fn of_type(security_type: &str) -> Self {
        Self {
            security_type: Some(security_type.to_string()),
            ..Default::default()
        }
    }

    /// The parsed type, or `None` when no type is set or it is not one we know.
    pub fn kind(&self) -> Option<SecurityType> {
        self.security_type.as_deref().and_then(SecurityType::parse)
    }
}

/// Known security types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityType {
    Credentials,
    Certificate,
    Token,
    AccessKeys,
}

impl SecurityType {
    /// Parse a wire value, ignoring case and accepting `-` for `_`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "CREDENTIALS" => Some(SecurityType::Credentials),
            "CERTIFICATE" => Some(SecurityType::Certificate),
            "TOKEN" => Some(SecurityType::Token),
            "ACCESS_KEYS" => Some(SecurityType::AccessKeys),
            _ => None,
        }
    }

    /// Canonical wire value.
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityType::Credentials => "CREDENTIALS",
            SecurityType::Certificate => "CERTIFICATE",
            SecurityType::Token => "TOKEN",
            SecurityType::AccessKeys => "ACCESS_KEYS",
        }
    }
}

impl std::fmt::Display for SecurityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_canonical_key_ignores_input_field_order() {
        let a: Target =
            serde_json::from_str(r#"{"url":"localhost:5672","queue":"q1"}"#).unwrap();
        let b: Target =
            serde_json::from_str(r#"{"queue":"q1","url":"localhost:5672"}"#).unwrap();
        assert_eq!(a.canonical_key().unwrap(), b.canonical_key().unwrap());
    }

    #[test]
    fn test_canonical_key_distinguishes_security() {
        let plain = Target::new("localhost:5672").with_queue("q1");
        let secured = plain
            .clone()
            .with_security(SecurityDescriptor::credentials("guest", "guest"));
        assert_ne!(plain.canonical_key().unwrap(), secured.canonical_key().unwrap());
    }

    #[test]
    fn test_unknown_fields_are_kept_in_key() {
        let a: Target =
            serde_json::from_str(r#"{"url":"h","topic":"t","zone":"a","region":"x"}"#).unwrap();
        let b: Target =
            serde_json::from_str(r#"{"url":"h","topic":"t","region":"x","zone":"b"}"#).unwrap();
        assert_eq!(a.extra.len(), 2);
        assert_ne!(a.canonical_key().unwrap(), b.canonical_key().unwrap());
        assert_eq!(
            a.canonical_key().unwrap(),
            r#"{"url":"h","topic":"t","region":"x","zone":"a"}"#
        );
    }

    #[test]
    fn test_security_type_parsing() {
        assert_eq!(SecurityType::parse("CERTIFICATE"), Some(SecurityType::Certificate));
        assert_eq!(SecurityType::parse("access_keys"), Some(SecurityType::AccessKeys));
        assert_eq!(SecurityType::parse("Access-Keys"), Some(SecurityType::AccessKeys));
        assert_eq!(SecurityType::parse("oauth"), None);
    }

    #[test]
    fn test_unknown_security_type_still_decodes() {
        let target: Target = serde_json::from_str(
            r#"{"url":"localhost","queue":"q","security":{"type":"oauth"}}"#,
        )
        .unwrap();
        assert_eq!(target.security_type(), Some("oauth"));
        assert_eq!(target.security.unwrap().kind(), None);
    }

    #[test]
    fn test_serializer_presence() {
        let mut target = Target::new("h");
        assert!(!target.has_message_serializer());
        target.message_serializer = Some(serde_json::json!({"type": "json"}));
        assert!(target.has_message_serializer());
        target.key_serializer = Some(Value::Null);
        assert!(!target.has_key_serializer());
    }
}
