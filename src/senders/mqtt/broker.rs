//! Client for self-hosted MQTT brokers.

use std::time::Duration;

use rumqttc::{AsyncClient, MqttOptions, Transport};
use tracing::debug;

use super::{base_options, connect, tls, BrokerAddress};
use crate::error::{Result, SenderError};
use crate::security::{self, Protocol, SecurityBundle};
use crate::senders::cache::ConnectionCache;
use crate::types::Target;

/// Connections to self-hosted brokers, one per distinct target.
///
/// Server certificates are never verified.
pub struct BrokerClient {
    connect_timeout: Duration,
    connections: ConnectionCache<AsyncClient>,
}

impl BrokerClient {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            connections: ConnectionCache::new(),
        }
    }

    /// Cached client for the target, connecting on first use.
    pub async fn client_for(&self, target: &Target) -> Result<AsyncClient> {
        self.connections
            .get_or_connect(target, |evictor| async move {
                let options = options_for(target)?;
                connect(options, &target.url, self.connect_timeout, evictor).await
            })
            .await
    }
}

/// Translate a target into connection options.
fn options_for(target: &Target) -> Result<MqttOptions> {
    let bundle = security::resolve(Protocol::Mqtt, target.security.as_ref())?;
    let address = BrokerAddress::parse(&target.url)?;

    let identity = match &bundle {
        SecurityBundle::Certificates(certs) => {
            Some(tls::identity(certs.cert.as_bytes(), certs.key.as_bytes())?)
        }
        _ => None,
    };

    let (mut options, transport) = match address.scheme.as_str() {
        "mqtt" | "tcp" => (base_options(&address.host, address.port_or(1883)), Transport::Tcp),
        "mqtts" | "ssl" | "tls" => (
            base_options(&address.host, address.port_or(8883)),
            Transport::Tls(tls::insecure(identity)?),
        ),
        "ws" => (base_options(&target.url, address.port_or(80)), Transport::Ws),
        "wss" => (
            base_options(&target.url, address.port_or(443)),
            Transport::Wss(tls::insecure(identity)?),
        ),
        other => {
            return Err(SenderError::InvalidUrl {
                url: target.url.clone(),
                reason: format!("unsupported scheme '{}'", other),
            })
        }
    };
    options.set_transport(transport);

    if let SecurityBundle::Credentials(credentials) = bundle {
        options.set_credentials(credentials.username, credentials.password.unwrap_or_default());
    }

    debug!(url = %target.url, scheme = %address.scheme, "MQTT options prepared");
    Ok(options)
}
