//! Dispatch engine shared by every adapter.
//!
//! The engine consumes one control queue, tracks session state, and turns
//! adapter results into confirmation or error envelopes.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use lapin::options::{BasicConsumeOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::Channel;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tracing::{debug, error, info, warn};

use super::protocol::normalize_target;
use super::Sender;
use crate::error::{Result, SenderError};
use crate::messaging::FeedbackPublisher;
use crate::serializer::{EntitySerializer, SerializerRole};
use crate::sessions::SessionStore;
use crate::types::{DispatchRequest, FeedbackEnvelope, Payload, SessionState, Target};

/// Consumes a sender's control queue and drives it.
pub struct DispatchEngine {
    sender: Arc<dyn Sender>,
    serializer: Arc<dyn EntitySerializer>,
    sessions: RwLock<SessionStore>,
    in_flight: Arc<Semaphore>,
}

impl DispatchEngine {
    /// Create an engine around an adapter.
    ///
    /// At most `max_in_flight` deliveries are handled at once.
    pub fn new(
        sender: Arc<dyn Sender>,
        serializer: Arc<dyn EntitySerializer>,
        max_in_flight: usize,
    ) -> Self {
        Self {
            sender,
            serializer,
            sessions: RwLock::new(SessionStore::new()),
            in_flight: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    /// Control queue consumed by this engine.
    pub fn queue_name(&self) -> &str {
        self.sender.queue_name()
    }

    /// Adapter behind this engine.
    pub fn sender(&self) -> &Arc<dyn Sender> {
        &self.sender
    }

    /// Declare the control queue and start consuming it.
    ///
    /// Deliveries are acknowledged as they leave the queue; each one is
    /// handled on its own task. Returns once the consumer is registered.
    /// When the consumer ends, an error is sent on `stopped`.
    pub async fn init(
        self: &Arc<Self>,
        channel: &Channel,
        feedback: Arc<dyn FeedbackPublisher>,
        stopped: mpsc::UnboundedSender<SenderError>,
    ) -> Result<()> {
        let queue = self.queue_name().to_string();

        channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let consumer = channel
            .basic_consume(
                &queue,
                &format!("data-sender-{}", self.sender.name()),
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        info!(queue = %queue, sender = self.sender.name(), "Started consuming");

        let bodies = consumer.map(|delivery| delivery.map(|d| d.data).map_err(SenderError::from));
        tokio::spawn(Arc::clone(self).consume_stream(bodies, feedback, stopped));

        Ok(())
    }

    /// Drive message bodies through the engine until the stream ends or
    /// fails, then report the stop on `stopped`.
    pub async fn consume_stream<S>(
        self: Arc<Self>,
        mut bodies: S,
        feedback: Arc<dyn FeedbackPublisher>,
        stopped: mpsc::UnboundedSender<SenderError>,
    ) where
        S: Stream<Item = Result<Vec<u8>>> + Send + Unpin,
    {
        let queue = self.queue_name().to_string();

        while let Some(body) = bodies.next().await {
            match body {
                Ok(body) => {
                    let permit = match Arc::clone(&self.in_flight).acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let engine = Arc::clone(&self);
                    let feedback = Arc::clone(&feedback);
                    tokio::spawn(async move {
                        engine.consume_message(&body, feedback.as_ref()).await;
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(queue = %queue, error = %e, "Consumer error");
                    break;
                }
            }
        }

        warn!(queue = %queue, "Consumer stopped");
        let _ = stopped.send(SenderError::ConsumerStopped(queue));
    }

    /// Handle one raw control-queue message.
    ///
    /// Never fails: malformed messages are dropped, adapter failures become
    /// error envelopes while the session is running.
    pub async fn consume_message(&self, body: &[u8], feedback: &dyn FeedbackPublisher) {
        let request = match DispatchRequest::from_slice(body) {
            Ok(request) => request,
            Err(e) => {
                error!(queue = %self.queue_name(), error = %e, "Dropping malformed dispatch request");
                return;
            }
        };

        let state = request.transition();
        let target = normalize_target(self.sender.as_ref(), request.target);
        let session_id = request.session_id;

        if let Err(e) = self
            .process_message(&session_id, &target, state, request.payload, feedback)
            .await
        {
            error!(session_id = %session_id, url = %target.url, error = %e, "Dispatch failed");
            self.send_error(&session_id, &e, feedback).await;
        }
    }

    /// Record the session transition and route the message.
    pub async fn process_message(
        &self,
        session_id: &str,
        target: &Target,
        state: SessionState,
        payload: Value,
        feedback: &dyn FeedbackPublisher,
    ) -> Result<()> {
        let previous = self.sessions.write().await.set_state(session_id, state);
        if previous.is_some_and(|p| p.is_terminal()) && state == SessionState::Running {
            debug!(session_id = %session_id, "Payload for a finished session, marking running again");
        }

        match state {
            SessionState::Completed => {
                info!(session_id = %session_id, "Session completed");
                self.sender.on_session_completed(session_id, target).await
            }
            SessionState::Failed => {
                info!(session_id = %session_id, "Session failed");
                self.sender.on_session_failed(session_id, target).await
            }
            SessionState::Running => self.send_payload(session_id, target, payload, feedback).await,
        }
    }

    async fn send_payload(
        &self,
        session_id: &str,
        target: &Target,
        payload: Value,
        feedback: &dyn FeedbackPublisher,
    ) -> Result<()> {
        let mut outgoing = Payload::from_value(payload.clone());
        if target.has_message_serializer() {
            outgoing = self
                .serializer
                .serialize(target, SerializerRole::Message, outgoing)
                .await?;
        }

        self.sender.send_payload(session_id, target, outgoing).await?;
        self.send_confirmation(session_id, &payload, feedback).await;
        Ok(())
    }

    /// Report a delivered payload.
    pub async fn send_confirmation(
        &self,
        session_id: &str,
        payload: &Value,
        feedback: &dyn FeedbackPublisher,
    ) {
        let envelope = FeedbackEnvelope::confirmation(session_id, payload);
        if let Err(e) = feedback.publish(&envelope).await {
            warn!(session_id = %session_id, error = %e, "Failed to publish confirmation");
        }
    }

    /// Report a failure, unless the session is no longer running.
    pub async fn send_error(
        &self,
        session_id: &str,
        err: &SenderError,
        feedback: &dyn FeedbackPublisher,
    ) {
        if !self.sessions.read().await.is_running(session_id) {
            warn!(session_id = %session_id, error = %err, "Session not running, error not reported");
            return;
        }

        let envelope = FeedbackEnvelope::error(session_id, &err.to_string());
        if let Err(e) = feedback.publish(&envelope).await {
            warn!(session_id = %session_id, error = %e, "Failed to publish error");
        }
    }

    /// Last recorded state of a session.
    pub async fn session_state(&self, session_id: &str) -> Option<SessionState> {
        self.sessions.read().await.get_state(session_id)
    }
}
