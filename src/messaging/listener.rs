//! Control-queue listener with unconditional reconnect.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use tracing::{error, info};

use super::feedback::{AmqpFeedbackPublisher, FeedbackPublisher};
use super::rabbit_client::RabbitClient;
use crate::error::Result;
use crate::senders::DispatchEngine;
use crate::types::SenderConfig;

/// One connection lifetime against the control broker.
#[async_trait]
pub trait ControlBroker: Send + Sync {
    /// Connect, boot the engines, and return once the connection is lost.
    async fn serve(&self, engines: &[Arc<DispatchEngine>]) -> Result<()>;
}

/// RabbitMQ control broker: a shared channel for every consumer and the
/// feedback exchange.
pub struct RabbitControlBroker {
    url: String,
    feedback_exchange: String,
}

impl RabbitControlBroker {
    pub fn new(config: &SenderConfig) -> Self {
        Self {
            url: config.rabbitmq_url.clone(),
            feedback_exchange: config.feedback_exchange.clone(),
        }
    }
}

#[async_trait]
impl ControlBroker for RabbitControlBroker {
    async fn serve(&self, engines: &[Arc<DispatchEngine>]) -> Result<()> {
        let mut client = RabbitClient::connect(&self.url).await?;

        let feedback: Arc<dyn FeedbackPublisher> = Arc::new(
            AmqpFeedbackPublisher::declare(client.channel().clone(), &self.feedback_exchange)
                .await?,
        );

        try_join_all(engines.iter().map(|engine| {
            engine.init(client.channel(), Arc::clone(&feedback), client.stop_signal())
        }))
        .await?;

        info!(engines = engines.len(), "All senders consuming");

        Err(client.closed().await)
    }
}

/// Owns the control connection and boots every engine on it.
///
/// Engines outlive reconnects, so connection caches and session states are
/// kept when the control broker goes away.
pub struct ControlListener {
    broker: Arc<dyn ControlBroker>,
    reconnect_delay: Duration,
    engines: Vec<Arc<DispatchEngine>>,
}

impl ControlListener {
    /// Create a listener for the given engines on the configured RabbitMQ.
    pub fn new(config: &SenderConfig, engines: Vec<Arc<DispatchEngine>>) -> Self {
        Self::with_broker(
            Arc::new(RabbitControlBroker::new(config)),
            config.reconnect_delay(),
            engines,
        )
    }

    /// Create a listener on any control broker.
    pub fn with_broker(
        broker: Arc<dyn ControlBroker>,
        reconnect_delay: Duration,
        engines: Vec<Arc<DispatchEngine>>,
    ) -> Self {
        Self {
            broker,
            reconnect_delay,
            engines,
        }
    }

    /// Engines booted on each connection.
    pub fn engines(&self) -> &[Arc<DispatchEngine>] {
        &self.engines
    }

    /// Run forever: connect, serve until the connection fails, wait, retry.
    pub async fn run(&self) {
        loop {
            if let Err(e) = self.broker.serve(&self.engines).await {
                error!(error = %e, "Control connection failed");
            }

            info!(delay_ms = self.reconnect_delay.as_millis() as u64, "Reconnecting to control broker");
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use serde_json::json;
    use tokio::sync::Notify;
    use tokio::time::Instant;

    use crate::error::SenderError;
    use crate::senders::DummySender;
    use crate::serializer::JsonEntitySerializer;
    use crate::types::{FeedbackEnvelope, SessionState};

    struct NullFeedback;

    #[async_trait]
    impl FeedbackPublisher for NullFeedback {
        async fn publish(&self, _envelope: &FeedbackEnvelope) -> Result<()> {
            Ok(())
        }
    }

    /// Fails the first `failures` connections, then stays connected.
    struct FlakyBroker {
        failures: usize,
        attempts: Mutex<Vec<Instant>>,
        /// State of session `s1` when each connection came up.
        seen_states: Mutex<Vec<Option<SessionState>>>,
        connected: Notify,
    }

    impl FlakyBroker {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                attempts: Mutex::new(Vec::new()),
                seen_states: Mutex::new(Vec::new()),
                connected: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl ControlBroker for FlakyBroker {
        async fn serve(&self, engines: &[Arc<DispatchEngine>]) -> Result<()> {
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                attempts.push(Instant::now());
                attempts.len()
            };
            let state = engines[0].session_state("s1").await;
            self.seen_states.lock().unwrap().push(state);

            // Each lifetime sees one payload for the same session.
            let body = serde_json::to_vec(&json!({
                "sessionId": "s1",
                "target": {"url": "h", "queue": "q"},
                "payload": attempt,
            }))
            .unwrap();
            engines[0].consume_message(&body, &NullFeedback).await;

            if attempt <= self.failures {
                return Err(SenderError::ConnectionClosed("control broker".into()));
            }
            self.connected.notify_one();
            futures::future::pending().await
        }
    }

    fn engine() -> Arc<DispatchEngine> {
        Arc::new(DispatchEngine::new(
            Arc::new(DummySender::new("sender.dummy")),
            Arc::new(JsonEntitySerializer::new()),
            4,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_fixed_delay() {
        let broker = Arc::new(FlakyBroker::new(2));
        let delay = Duration::from_millis(5000);
        let listener = Arc::new(ControlListener::with_broker(
            broker.clone(),
            delay,
            vec![engine()],
        ));

        let running = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.run().await })
        };
        broker.connected.notified().await;

        let attempts = broker.attempts.lock().unwrap().clone();
        assert_eq!(attempts.len(), 3);
        for pair in attempts.windows(2) {
            assert_eq!(pair[1] - pair[0], delay);
        }

        running.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_engines_survive_reconnects() {
        let broker = Arc::new(FlakyBroker::new(1));
        let listener = Arc::new(ControlListener::with_broker(
            broker.clone(),
            Duration::from_millis(100),
            vec![engine()],
        ));

        let running = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.run().await })
        };
        broker.connected.notified().await;

        assert_eq!(
            *broker.seen_states.lock().unwrap(),
            vec![None, Some(SessionState::Running)]
        );
        assert_eq!(
            listener.engines()[0].session_state("s1").await,
            Some(SessionState::Running)
        );

        running.abort();
    }
}
