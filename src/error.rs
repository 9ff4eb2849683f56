//! Error type shared by the dispatch engine, the senders and the listener.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while decoding, connecting or publishing.
///
/// The `Display` text of a variant is what ends up in the `message` field of
/// an error envelope, so it is written for the session owner to read.
#[derive(Debug, Error)]
pub enum SenderError {
    /// The target asked for a security type this protocol cannot use.
    #[error("security type '{security_type}' is not supported by the {protocol} sender")]
    UnsupportedSecurity {
        protocol: &'static str,
        security_type: String,
    },

    /// A security descriptor lacks a field its type requires.
    #[error("security descriptor of type {security_type} is missing '{field}'")]
    MissingSecurityField {
        security_type: &'static str,
        field: &'static str,
    },

    /// Certificate material was not valid base64.
    #[error("security field '{field}' is not valid base64: {source}")]
    InvalidSecurityEncoding {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },

    /// The target is missing the queue or topic the sender publishes to.
    #[error("target {url} has no {field} configured")]
    MissingDestination { url: String, field: &'static str },

    /// The target URL could not be used to open a connection.
    #[error("invalid target url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("mqtt error: {0}")]
    Mqtt(String),

    #[error("tls configuration error: {0}")]
    Tls(String),

    /// No connection acknowledgement arrived in time.
    #[error("connection to {url} timed out after {timeout:?}")]
    ConnectTimeout { url: String, timeout: Duration },

    /// The broker closed the connection before it became usable.
    #[error("connection to {0} was closed")]
    ConnectionClosed(String),

    /// A control-queue consumer ended while its connection looked alive.
    #[error("consumer on {0} stopped")]
    ConsumerStopped(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("key function error: {0}")]
    KeyFunction(String),

    #[error("request signing failed: {0}")]
    Signing(String),
}

impl From<rumqttc::ClientError> for SenderError {
    fn from(err: rumqttc::ClientError) -> Self {
        SenderError::Mqtt(err.to_string())
    }
}

impl From<rumqttc::ConnectionError> for SenderError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        SenderError::Mqtt(err.to_string())
    }
}

impl From<rustls::Error> for SenderError {
    fn from(err: rustls::Error) -> Self {
        SenderError::Tls(err.to_string())
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, SenderError>;
