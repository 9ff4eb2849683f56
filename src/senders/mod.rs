//! Protocol adapters and the dispatch engine they plug into.

pub mod amqp;
pub mod cache;
pub mod dummy;
pub mod engine;
pub mod kafka;
pub mod mqtt;
pub mod protocol;

pub use amqp::AmqpSender;
pub use cache::{CacheEvictor, ConnectionCache};
pub use dummy::DummySender;
pub use engine::DispatchEngine;
pub use kafka::KafkaSender;
pub use mqtt::MqttSender;
pub use protocol::{normalize_target, parse_protocol};

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Payload, SecurityType, Target};

/// The trait every protocol adapter implements.
///
/// An adapter publishes one payload to one target. Session bookkeeping,
/// serialization of the message body and feedback are handled by the
/// [`DispatchEngine`] that owns it.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Control queue this adapter consumes.
    fn queue_name(&self) -> &str;

    /// Scheme prepended to target URLs that carry none.
    ///
    /// `None` leaves such URLs untouched.
    fn protocol_prefix(&self, security: Option<SecurityType>) -> Option<&'static str> {
        let _ = security;
        None
    }

    /// Publish one payload.
    async fn send_payload(&self, session_id: &str, target: &Target, payload: Payload) -> Result<()>;

    /// Called when the session completes.
    async fn on_session_completed(&self, session_id: &str, target: &Target) -> Result<()> {
        let _ = (session_id, target);
        Ok(())
    }

    /// Called when the session fails upstream.
    async fn on_session_failed(&self, session_id: &str, target: &Target) -> Result<()> {
        let _ = (session_id, target);
        Ok(())
    }
}
