//! RabbitMQ client for the control broker.
//!
//! Holds the single inbound connection and the channel shared by every
//! engine and the feedback publisher.

use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::mpsc;
use tracing::{error, info, instrument};

use crate::error::{Result, SenderError};

/// Live control-broker connection.
pub struct RabbitClient {
    // Kept so the connection lives as long as the client.
    _connection: Connection,
    channel: Channel,
    stopped: mpsc::UnboundedSender<SenderError>,
    errors: mpsc::UnboundedReceiver<SenderError>,
}

impl RabbitClient {
    /// Connect and open the shared channel.
    #[instrument(skip_all)]
    pub async fn connect(url: &str) -> Result<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;

        let (stopped, errors) = mpsc::unbounded_channel();
        let tx = stopped.clone();
        connection.on_error(move |e| {
            error!(error = %e, "Control connection error");
            let _ = tx.send(e.into());
        });

        let channel = connection.create_channel().await?;
        info!("Connected to control broker");

        Ok(Self {
            _connection: connection,
            channel,
            stopped,
            errors,
        })
    }

    /// The shared channel.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Handle for consumers to report that they stopped.
    pub fn stop_signal(&self) -> mpsc::UnboundedSender<SenderError> {
        self.stopped.clone()
    }

    /// Wait for the connection or one of its consumers to fail.
    pub async fn closed(&mut self) -> SenderError {
        match self.errors.recv().await {
            Some(e) => e,
            None => SenderError::ConnectionClosed("control broker".to_string()),
        }
    }
}
