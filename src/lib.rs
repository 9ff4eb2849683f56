//! Data Sender Service Library
//!
//! A multi-protocol dispatch gateway. Dispatch requests arrive on per-sender
//! queues of a control RabbitMQ broker and are relayed to AMQP, Kafka or MQTT
//! (self-hosted or AWS IoT) targets. Delivery confirmations and errors are
//! reported back per session on a topic exchange of the same broker.

pub mod error;
pub mod key_expr;
pub mod messaging;
pub mod security;
pub mod senders;
pub mod serializer;
pub mod sessions;
pub mod types;

pub use error::{Result, SenderError};
pub use messaging::{ControlListener, FeedbackPublisher};
pub use senders::{
    AmqpSender, DispatchEngine, DummySender, KafkaSender, MqttSender, Sender,
};
pub use serializer::{EntitySerializer, JsonEntitySerializer, SerializerRole};
pub use types::{DispatchRequest, FeedbackEnvelope, Payload, SenderConfig, SessionState, Target};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{Result, SenderError};
    pub use crate::senders::*;
    pub use crate::serializer::*;
    pub use crate::types::*;
}

/// Control queue of the AMQP sender
pub const AMQP_QUEUE: &str = "sender.amqp";

/// Control queue of the Kafka sender
pub const KAFKA_QUEUE: &str = "sender.kafka";

/// Control queue of the MQTT sender
pub const MQTT_QUEUE: &str = "sender.mqtt";

/// Control queue of the dummy sender
pub const DUMMY_QUEUE: &str = "sender.dummy";

/// Topic exchange carrying session feedback
pub const FEEDBACK_EXCHANGE: &str = "amq.topic";

/// Fixed delay before the control listener reconnects
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3000;

/// Connect/request timeout towards target brokers
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Messages handled concurrently per sender
pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;
