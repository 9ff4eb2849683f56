//! AMQP adapter: publishes to a durable queue on the target broker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::tcp::{OwnedIdentity, OwnedTLSConfig};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{info, instrument, warn};
use url::Url;

use super::cache::{CacheEvictor, ConnectionCache};
use super::Sender;
use crate::error::{Result, SenderError};
use crate::security::{self, CertificateBundle, Credentials, Protocol, SecurityBundle};
use crate::types::{Payload, SecurityType, Target};

/// Open connection plus the channel publishes go through.
#[derive(Clone)]
pub struct AmqpConnection {
    connection: Arc<Connection>,
    channel: Channel,
}

/// What to do with a cached connection before publishing on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Health {
    Ready,
    /// A channel exception closed the channel; the connection is still up.
    ChannelClosed,
    ConnectionClosed,
}

impl Health {
    fn of(connection_up: bool, channel_up: bool) -> Self {
        match (connection_up, channel_up) {
            (false, _) => Health::ConnectionClosed,
            (true, false) => Health::ChannelClosed,
            (true, true) => Health::Ready,
        }
    }
}

/// Sender for generic queueing brokers.
pub struct AmqpSender {
    queue: String,
    connect_timeout: Duration,
    connections: ConnectionCache<AmqpConnection>,
}

impl AmqpSender {
    /// Create a sender consuming `queue`.
    pub fn new(queue: &str, connect_timeout: Duration) -> Self {
        Self {
            queue: queue.to_string(),
            connect_timeout,
            connections: ConnectionCache::new(),
        }
    }

    async fn connect(
        &self,
        target: &Target,
        evictor: CacheEvictor<AmqpConnection>,
    ) -> Result<AmqpConnection> {
        let bundle = security::resolve(Protocol::Amqp, target.security.as_ref())?;
        let properties = ConnectionProperties::default();

        let connecting = async {
            let connection = match bundle {
                SecurityBundle::Credentials(credentials) => {
                    let uri = url_with_credentials(&target.url, &credentials)?;
                    Connection::connect(&uri, properties).await
                }
                SecurityBundle::Certificates(bundle) => {
                    Connection::connect_with_config(&target.url, properties, tls_config(bundle))
                        .await
                }
                _ => Connection::connect(&target.url, properties).await,
            };
            connection.map_err(SenderError::from)
        };

        let connection = tokio::time::timeout(self.connect_timeout, connecting)
            .await
            .map_err(|_| SenderError::ConnectTimeout {
                url: target.url.clone(),
                timeout: self.connect_timeout,
            })??;

        let url = target.url.clone();
        connection.on_error(move |e| {
            warn!(url = %url, error = %e, "AMQP target connection failed, evicting");
            evictor.evict();
        });

        let channel = connection.create_channel().await?;
        info!(url = %target.url, "AMQP target connection established");

        Ok(AmqpConnection {
            connection: Arc::new(connection),
            channel,
        })
    }
}

/// Embed credentials into the URL, keeping host, port and vhost.
fn url_with_credentials(raw: &str, credentials: &Credentials) -> Result<String> {
    let invalid = |reason: String| SenderError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };

    let mut url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    url.set_username(&credentials.username)
        .map_err(|_| invalid("url cannot carry credentials".to_string()))?;
    url.set_password(credentials.password.as_deref())
        .map_err(|_| invalid("url cannot carry credentials".to_string()))?;
    Ok(url.to_string())
}

async fn publish(channel: &Channel, queue: &str, body: &[u8]) -> Result<()> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    channel
        .basic_publish(
            "",
            queue,
            BasicPublishOptions::default(),
            body,
            BasicProperties::default(),
        )
        .await?;
    Ok(())
}

fn tls_config(bundle: CertificateBundle) -> OwnedTLSConfig {
    OwnedTLSConfig {
        identity: Some(OwnedIdentity::PKCS8 {
            pem: bundle.cert.into_bytes(),
            key: bundle.key.into_bytes(),
        }),
        cert_chain: bundle.ca,
    }
}

#[async_trait]
impl Sender for AmqpSender {
    fn name(&self) -> &'static str {
        "amqp"
    }

    fn queue_name(&self) -> &str {
        &self.queue
    }

    fn protocol_prefix(&self, security: Option<SecurityType>) -> Option<&'static str> {
        match security {
            Some(SecurityType::Certificate) => Some("amqps://"),
            _ => Some("amqp://"),
        }
    }

    #[instrument(skip(self, target, payload), fields(url = %target.url))]
    async fn send_payload(&self, session_id: &str, target: &Target, payload: Payload) -> Result<()> {
        let queue = target.require_queue()?;
        let mut conn = self
            .connections
            .get_or_connect(target, |evictor| self.connect(target, evictor))
            .await?;

        match Health::of(
            conn.connection.status().connected(),
            conn.channel.status().connected(),
        ) {
            Health::Ready => {}
            Health::ChannelClosed => {
                warn!(url = %target.url, "AMQP channel closed, reopening");
                conn.channel = conn.connection.create_channel().await?;
                self.connections.refresh(target, conn.clone())?;
            }
            Health::ConnectionClosed => {
                self.connections.remove(target)?;
                return Err(SenderError::ConnectionClosed(target.url.clone()));
            }
        }

        let body = payload.into_bytes()?;
        // A channel closed by this publish is reopened by the next send.
        publish(&conn.channel, queue, &body).await?;

        info!(session_id = %session_id, queue = %queue, bytes = body.len(), "Payload published");
        Ok(())
    }
}
