//! Sender that accepts every payload without publishing it.

use async_trait::async_trait;
use tracing::debug;

use super::Sender;
use crate::error::Result;
use crate::types::{Payload, Target};

/// No-op adapter, useful for exercising sessions without a broker.
pub struct DummySender {
    queue: String,
}

impl DummySender {
    pub fn new(queue: &str) -> Self {
        Self {
            queue: queue.to_string(),
        }
    }
}

#[async_trait]
impl Sender for DummySender {
    fn name(&self) -> &'static str {
        "dummy"
    }

    fn queue_name(&self) -> &str {
        &self.queue
    }

    async fn send_payload(&self, session_id: &str, target: &Target, payload: Payload) -> Result<()> {
        debug!(
            session_id = %session_id,
            url = %target.url,
            bytes = payload.len(),
            "Dropping payload"
        );
        Ok(())
    }
}
