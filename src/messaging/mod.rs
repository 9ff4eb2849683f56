//! Control-broker messaging.
//!
//! - [`RabbitClient`]: the single inbound connection and its shared channel
//! - [`ControlListener`]: boots the engines through a [`ControlBroker`] and reconnects forever
//! - [`FeedbackPublisher`]: confirmation/error envelopes on the topic exchange

pub mod feedback;
pub mod listener;
pub mod rabbit_client;

pub use feedback::{AmqpFeedbackPublisher, FeedbackPublisher};
pub use listener::{ControlBroker, ControlListener, RabbitControlBroker};
pub use rabbit_client::RabbitClient;
