//! Client for AWS IoT Core device endpoints.

use std::time::Duration;

use chrono::Utc;
use rumqttc::{AsyncClient, MqttOptions, Transport};
use tracing::debug;

use super::{base_options, connect, tls, BrokerAddress};
use crate::error::{Result, SenderError};
use crate::security::{self, presign_iot_websocket_url, Protocol, SecurityBundle};
use crate::senders::cache::ConnectionCache;
use crate::senders::protocol::parse_protocol;
use crate::types::Target;

const MQTTS_PORT: u16 = 8883;
const WSS_PORT: u16 = 443;

/// Connections to AWS IoT, one per distinct target.
///
/// Device certificates give a mutual-TLS connection; access keys give a
/// SigV4-presigned websocket connection.
pub struct AwsIotClient {
    connect_timeout: Duration,
    connections: ConnectionCache<AsyncClient>,
}

impl AwsIotClient {
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

fn options_for(target: &Target) -> Result<MqttOptions> {
    let bundle = security::resolve(Protocol::AwsMqtt, target.security.as_ref())?;
    let address = BrokerAddress::parse(&target.url)?;

    match bundle {
        SecurityBundle::AwsCertificates(certs) => {
            let identity = tls::identity(&certs.client_cert, &certs.private_key)?;
            let tls = tls::verified(certs.ca_cert.as_deref(), Some(identity))?;

            let mut options = base_options(&address.host, address.port_or(MQTTS_PORT));
            options.set_transport(Transport::Tls(tls));
            debug!(host = %address.host, "AWS IoT certificate options prepared");
            Ok(options)
        }
        SecurityBundle::AccessKeys(keys) => {
            let scheme = match parse_protocol(&target.url) {
                "" => "wss",
                scheme => scheme,
            };
            let url = presign_iot_websocket_url(
                scheme,
                &address.host,
                &keys.access_key_id,
                &keys.secret_key,
                Utc::now(),
            )?;

            let mut options = base_options(&url, address.port_or(WSS_PORT));
            options.set_transport(Transport::Wss(tls::verified(None, None)?));
            debug!(host = %address.host, "AWS IoT websocket options prepared");
            Ok(options)
        }
        _ => Err(SenderError::UnsupportedSecurity {
            protocol: Protocol::AwsMqtt.name(),
            security_type: target.security_type().unwrap_or("none").to_string(),
        }),
    }
}
