//! Core types for the sender service.

mod config;
mod envelope;
mod payload;
mod request;
mod target;

pub use config::{SenderConfig, DEFAULT_RABBITMQ_URL};
pub use envelope::{FeedbackEnvelope, FeedbackKind};
pub use payload::Payload;
pub use request::{DispatchRequest, SessionState, SESSION_COMPLETED, SESSION_FAILED};
pub use target::{SecurityDescriptor, SecurityType, Target, URL_PROTOCOL_DELIMITER};
