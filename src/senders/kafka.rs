//! Kafka adapter.
//!
//! One `FutureProducer` per distinct target. Keys come from the target's
//! key function, optionally passed through its key serializer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tracing::{debug, error, info, instrument, warn};

use super::cache::ConnectionCache;
use super::Sender;
use crate::error::{Result, SenderError};
use crate::key_expr::KeyFunctionRegistry;
use crate::security::{self, Protocol, SecurityBundle};
use crate::serializer::{EntitySerializer, SerializerRole};
use crate::types::{Payload, Target};

/// Sender for partitioned log brokers.
pub struct KafkaSender {
    queue: String,
    timeout: Duration,
    serializer: Arc<dyn EntitySerializer>,
    key_functions: KeyFunctionRegistry,
    producers: ConnectionCache<Arc<FutureProducer>>,
}

impl KafkaSender {
    /// Create a sender consuming `queue`.
    ///
    /// `timeout` bounds both the reachability check and each delivery.
    pub fn new(queue: &str, timeout: Duration, serializer: Arc<dyn EntitySerializer>) -> Self {
        Self {
            queue: queue.to_string(),
            timeout,
            serializer,
            key_functions: KeyFunctionRegistry::new(),
            producers: ConnectionCache::new(),
        }
    }

    /// Producer settings for a target.
    fn client_config(&self, target: &Target) -> Result<ClientConfig> {
        let bundle = security::resolve(Protocol::Kafka, target.security.as_ref())?;
        let timeout_ms = self.timeout.as_millis().to_string();

        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &target.url)
            .set("client.id", "data-sender")
            .set("acks", "1")
            .set("socket.connection.setup.timeout.ms", &timeout_ms)
            .set("request.timeout.ms", &timeout_ms)
            .set("message.timeout.ms", &timeout_ms);

        if let SecurityBundle::Certificates(certs) = bundle {
            config
                .set("security.protocol", "ssl")
                .set("ssl.certificate.pem", &certs.cert)
                .set("ssl.key.pem", &certs.key)
                .set("enable.ssl.certificate.verification", "false");
            if let Some(ca) = &certs.ca {
                config.set("ssl.ca.pem", ca);
            }
        }

        Ok(config)
    }

    async fn connect(&self, target: &Target) -> Result<Arc<FutureProducer>> {
        let producer: FutureProducer = self.client_config(target)?.create()?;
        let producer = Arc::new(producer);

        // Metadata requests block, keep them off the runtime threads.
        let handle = Arc::clone(&producer);
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || {
            handle
                .client()
                .fetch_metadata(None, Timeout::After(timeout))
                .map(|_| ())
        })
        .await
        .map_err(|e| SenderError::ConnectionClosed(format!("{}: {}", target.url, e)))??;

        info!(bootstrap = %target.url, "Kafka producer created");
        Ok(producer)
    }

    /// Derive the record key, if the target defines a key function.
    async fn resolve_key(&self, target: &Target, topic: &str, payload: &Payload) -> Result<Option<Vec<u8>>> {
        let Some(text) = target.key_function.as_deref().filter(|t| !t.trim().is_empty()) else {
            return Ok(None);
        };

        let function = self.key_functions.get_or_compile(text)?;
        let Some(key) = function.evaluate(payload, topic)? else {
            return Ok(None);
        };

        let key = if target.has_key_serializer() {
            self.serializer
                .serialize(target, SerializerRole::Key, Payload::Text(key))
                .await?
        } else {
            Payload::Text(key)
        };
        key.into_bytes().map(Some)
    }
}

#[async_trait]
impl Sender for KafkaSender {
    fn name(&self) -> &'static str {
        "kafka"
    }

    fn queue_name(&self) -> &str {
        &self.queue
    }

    #[instrument(skip(self, target, payload), fields(url = %target.url))]
    async fn send_payload(&self, session_id: &str, target: &Target, payload: Payload) -> Result<()> {
        let topic = target.require_topic()?;
        let producer = self
            .producers
            .get_or_connect(target, |_| self.connect(target))
            .await?;

        let key = self.resolve_key(target, topic, &payload).await?;
        let body = payload.into_bytes()?;

        let mut record: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(topic).payload(&body[..]);
        if let Some(key) = &key {
            record = record.key(&key[..]);
        }

        match producer.send(record, Timeout::After(self.timeout)).await {
            Ok((partition, offset)) => {
                debug!(
                    session_id = %session_id,
                    topic = %topic,
                    partition = partition,
                    offset = offset,
                    "Payload published"
                );
                Ok(())
            }
            Err((e, _)) => {
                error!(session_id = %session_id, topic = %topic, error = %e, "Failed to publish payload");
                self.producers.remove(target)?;
                Err(e.into())
            }
        }
    }

    async fn on_session_failed(&self, session_id: &str, target: &Target) -> Result<()> {
        if let Some(producer) = self.producers.remove(target)? {
            warn!(session_id = %session_id, url = %target.url, "Session failed, closing producer");
            let timeout = self.timeout;
            tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
                .await
                .map_err(|e| SenderError::ConnectionClosed(format!("{}: {}", target.url, e)))??;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::JsonEntitySerializer;
    use crate::types::SecurityDescriptor;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sender() -> KafkaSender {
        KafkaSender::new(
            "sender.kafka",
            Duration::from_millis(100),
            Arc::new(JsonEntitySerializer::new()),
        )
    }

    #[test]
    fn test_plain_client_config() {
        let target = Target::new("broker:9092").with_topic("t");
        let config = sender().client_config(&target).unwrap();
        assert_eq!(config.get("bootstrap.servers"), Some("broker:9092"));
        assert_eq!(config.get("request.timeout.ms"), Some("100"));
        assert_eq!(config.get("security.protocol"), None);
    }

    #[test]
    fn test_certificate_client_config() {
        use base64::Engine;
        let encode = |s: &str| base64::engine::general_purpose::STANDARD.encode(s);
        let target = Target::new("broker:9093").with_topic("t").with_security(
            SecurityDescriptor::certificate(&encode("CERT"), &encode("KEY"), Some(&encode("CA"))),
        );

        let config = sender().client_config(&target).unwrap();
        assert_eq!(config.get("security.protocol"), Some("ssl"));
        assert_eq!(config.get("ssl.certificate.pem"), Some("CERT"));
        assert_eq!(config.get("ssl.key.pem"), Some("KEY"));
        assert_eq!(config.get("ssl.ca.pem"), Some("CA"));
        assert_eq!(config.get("enable.ssl.certificate.verification"), Some("false"));
    }

    #[test]
    fn test_credentials_are_rejected() {
        let target = Target::new("broker:9092")
            .with_topic("t")
            .with_security(SecurityDescriptor::credentials("u", "p"));
        let err = sender().client_config(&target).unwrap_err();
        assert_eq!(
            err.to_string(),
            "security type 'CREDENTIALS' is not supported by the kafka sender"
        );
    }

    #[tokio::test]
    async fn test_key_from_function() {
        let mut target = Target::new("broker:9092").with_topic("t");
        target.key_function = Some("(payload, topic) => topic + ':' + payload.id".into());

        let key = sender()
            .resolve_key(&target, "t", &Payload::Json(json!({"id": 7})))
            .await
            .unwrap();
        assert_eq!(key, Some(b"t:7".to_vec()));
    }

    #[tokio::test]
    async fn test_key_goes_through_key_serializer() {
        let mut target = Target::new("broker:9092").with_topic("t");
        target.key_function = Some("m => m.id".into());
        target.key_serializer = Some(json!({"type": "json"}));

        let key = sender()
            .resolve_key(&target, "t", &Payload::Json(json!({"id": "abc"})))
            .await
            .unwrap();
        assert_eq!(key, Some(br#""abc""#.to_vec()));
    }

    #[tokio::test]
    async fn test_json_looking_text_has_no_properties() {
        let mut target = Target::new("broker:9092").with_topic("t");
        target.key_function = Some("m => m.id".into());

        let key = sender()
            .resolve_key(&target, "t", &Payload::Text(r#"{"id":"abc"}"#.into()))
            .await
            .unwrap();
        assert_eq!(key, None);
    }

    #[tokio::test]
    async fn test_serialized_payload_yields_no_key() {
        let mut target = Target::new("broker:9092").with_topic("t");
        target.key_function = Some("m => m.id".into());
        target.message_serializer = Some(json!({"type": "json"}));

        let key = sender()
            .resolve_key(&target, "t", &Payload::Binary(br#"{"id":7}"#.to_vec()))
            .await
            .unwrap();
        assert_eq!(key, None);
    }

    #[tokio::test]
    async fn test_no_key_function_means_no_key() {
        let target = Target::new("broker:9092").with_topic("t");
        let key = sender()
            .resolve_key(&target, "t", &Payload::Text("x".into()))
            .await
            .unwrap();
        assert_eq!(key, None);
    }

    #[tokio::test]
    async fn test_missing_topic_fails() {
        let err = sender()
            .send_payload("s1", &Target::new("broker:9092"), Payload::Text("x".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, SenderError::MissingDestination { field: "topic", .. }));
    }

    /// Cache a producer for the target without probing the broker.
    async fn cache_producer(sender: &KafkaSender, target: &Target) {
        let config = sender.client_config(target).unwrap();
        sender
            .producers
            .get_or_connect(target, |_| async move {
                config
                    .create::<FutureProducer>()
                    .map(Arc::new)
                    .map_err(SenderError::from)
            })
            .await
            .unwrap();
    }

    fn unreachable_sender() -> KafkaSender {
        KafkaSender::new(
            "sender.kafka",
            Duration::from_secs(1),
            Arc::new(JsonEntitySerializer::new()),
        )
    }

    #[tokio::test]
    async fn test_failed_session_closes_producer() {
        let sender = unreachable_sender();
        let target = Target::new("127.0.0.1:1").with_topic("t");
        cache_producer(&sender, &target).await;
        assert_eq!(sender.producers.len(), 1);

        sender.on_session_failed("s1", &target).await.unwrap();
        assert!(sender.producers.is_empty());

        // No producer left, so a second failure is a no-op.
        sender.on_session_failed("s1", &target).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_error_evicts_producer() {
        let sender = unreachable_sender();
        let target = Target::new("127.0.0.1:1").with_topic("t");
        cache_producer(&sender, &target).await;

        let err = sender
            .send_payload("s1", &target, Payload::Text("x".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, SenderError::Kafka(_)));
        assert!(sender.producers.is_empty());
    }
}
