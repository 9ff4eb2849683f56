//! MQTT adapter.
//!
//! Targets on `*.amazonaws.com` go through the AWS IoT client, everything
//! else through the self-hosted broker client. Both share the control queue
//! and the connect/supervise logic below.

mod aws;
mod broker;
pub mod tls;

pub use aws::AwsIotClient;
pub use broker::BrokerClient;

use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tracing::{debug, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use super::cache::CacheEvictor;
use super::Sender;
use crate::error::{Result, SenderError};
use crate::types::{Payload, SecurityType, Target};

lazy_static! {
    static ref AWS_HOST: Regex = Regex::new(r"(?i)(^|\.)amazonaws\.com$").unwrap();
}

/// Requests buffered between the client handle and its event loop.
const REQUEST_CAPACITY: usize = 64;

const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Sender for MQTT brokers, self-hosted or AWS IoT Core.
pub struct MqttSender {
    queue: String,
    broker: BrokerClient,
    aws: AwsIotClient,
}

impl MqttSender {
    /// Create a sender consuming `queue`.
    pub fn new(queue: &str, connect_timeout: Duration) -> Self {
        Self {
            queue: queue.to_string(),
            broker: BrokerClient::new(connect_timeout),
            aws: AwsIotClient::new(connect_timeout),
        }
    }
}

/// Whether the URL points at AWS IoT Core.
pub fn is_aws_target(url: &str) -> bool {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| AWS_HOST.is_match(h)))
        .unwrap_or(false)
}

#[async_trait]
impl Sender for MqttSender {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn queue_name(&self) -> &str {
        &self.queue
    }

    fn protocol_prefix(&self, security: Option<SecurityType>) -> Option<&'static str> {
        match security {
            Some(SecurityType::Certificate) => Some("mqtts://"),
            Some(SecurityType::AccessKeys) => Some("wss://"),
            _ => Some("mqtt://"),
        }
    }

    #[instrument(skip(self, target, payload), fields(url = %target.url))]
    async fn send_payload(&self, session_id: &str, target: &Target, payload: Payload) -> Result<()> {
        let topic = target.require_topic()?;
        let client = if is_aws_target(&target.url) {
            self.aws.client_for(target).await?
        } else {
            self.broker.client_for(target).await?
        };

        let body = payload.into_bytes()?;
        let bytes = body.len();
        client.publish(topic, QoS::AtMostOnce, false, body).await?;

        debug!(session_id = %session_id, topic = %topic, bytes = bytes, "Payload published");
        Ok(())
    }
}

/// Host, port and scheme of a broker URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BrokerAddress {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
}

impl BrokerAddress {
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).map_err(|e| SenderError::InvalidUrl {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;
        let host = url.host_str().ok_or_else(|| SenderError::InvalidUrl {
            url: raw.to_string(),
            reason: "missing host".to_string(),
        })?;
        Ok(Self {
            scheme: url.scheme().to_ascii_lowercase(),
            host: host.to_string(),
            port: url.port(),
        })
    }

    /// Explicit port, or the scheme's usual one.
    pub fn port_or(&self, default: u16) -> u16 {
        self.port.unwrap_or(default)
    }
}

/// A fresh client id per connection.
fn client_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("data-sender-{}", &id[..8])
}

/// Base options shared by both clients.
fn base_options(broker: &str, port: u16) -> MqttOptions {
    let mut options = MqttOptions::new(client_id(), broker, port);
    options.set_keep_alive(KEEP_ALIVE);
    options
}

/// Connect, wait for the CONNACK and keep the event loop running.
///
/// The event loop is polled on its own task for as long as the client is
/// alive; a polling error evicts the cached client.
async fn connect(
    options: MqttOptions,
    url: &str,
    timeout: Duration,
    evictor: CacheEvictor<AsyncClient>,
) -> Result<AsyncClient> {
    let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

    let acknowledged = tokio::time::timeout(timeout, async {
        loop {
            match eventloop.poll().await? {
                Event::Incoming(Packet::ConnAck(_)) => return Ok::<_, SenderError>(()),
                _ => continue,
            }
        }
    })
    .await;

    match acknowledged {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            return Err(SenderError::ConnectTimeout {
                url: url.to_string(),
                timeout,
            })
        }
    }

    info!(url = %url, "MQTT connection established");

    let url = url.to_string();
    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                warn!(url = %url, error = %e, "MQTT connection lost, evicting");
                evictor.evict();
                break;
            }
        }
    });

    Ok(client)
}
