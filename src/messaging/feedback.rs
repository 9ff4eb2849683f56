//! Session feedback published on the control broker.

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, ExchangeKind};
use tracing::{debug, info, instrument};

use crate::error::{Result, SenderError};
use crate::types::FeedbackEnvelope;

/// Destination of confirmation and error envelopes.
#[async_trait]
pub trait FeedbackPublisher: Send + Sync {
    async fn publish(&self, envelope: &FeedbackEnvelope) -> Result<()>;
}

/// Publishes envelopes to a topic exchange over the shared control channel.
pub struct AmqpFeedbackPublisher {
    channel: Channel,
    exchange: String,
}

impl AmqpFeedbackPublisher {
    /// Declare the exchange (topic, durable) and bind a publisher to it.
    pub async fn declare(channel: Channel, exchange: &str) -> Result<Self> {
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        info!(exchange = %exchange, "Feedback exchange declared");

        Ok(Self {
            channel,
            exchange: exchange.to_string(),
        })
    }
}

#[async_trait]
impl FeedbackPublisher for AmqpFeedbackPublisher {
    #[instrument(skip(self, envelope), fields(session_id = %envelope.session_id))]
    async fn publish(&self, envelope: &FeedbackEnvelope) -> Result<()> {
        let body = envelope
            .to_bytes()
            .map_err(|e| SenderError::Serialization(e.to_string()))?;
        let routing_key = envelope.routing_key();

        let properties =
            BasicProperties::default().with_content_type("application/json".into());

        self.channel
            .basic_publish(
                &self.exchange,
                &routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await?;

        debug!(exchange = %self.exchange, routing_key = %routing_key, "Feedback published");
        Ok(())
    }
}
