//! Pure MQTT option construction
//!
//! Turns the broker section of the configuration plus the credentials for this attempt into
//! rumqttc options. No I/O happens here.

use crate::auth::Credentials;
use crate::config::BrokerSection;
use crate::error::SessionError;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use url::Url;

/// Broker packets above this size are rejected by rumqttc
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Host, port and TLS flag parsed from a broker URL
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse `mqtt://host[:port]` or `mqtts://host[:port]`
pub fn parse_broker_url(broker_url: &str) -> Result<BrokerAddress, SessionError> {
    let url =
        Url::parse(broker_url).map_err(|_| SessionError::InvalidBrokerUrl(broker_url.into()))?;

    let tls = match url.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        _ => return Err(SessionError::InvalidBrokerUrl(broker_url.into())),
    };

    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| SessionError::InvalidBrokerUrl(broker_url.into()))?
        .to_string();
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok(BrokerAddress { host, port, tls })
}

/// Build MQTT options for one connect attempt
pub fn configure_mqtt_options(
    client_id: &str,
    broker: &BrokerSection,
    credentials: &Credentials,
) -> Result<MqttOptions, SessionError> {
    let address = parse_broker_url(&broker.broker_url)?;
    let mut mqtt_options = MqttOptions::new(client_id, address.host, address.port);

    if address.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    // Bearer tokens travel as the MQTT password.
    if !credentials.is_anonymous() {
        mqtt_options.set_credentials(
            credentials.username.clone().unwrap_or_default(),
            credentials.secret.clone().unwrap_or_default(),
        );
    }

    mqtt_options.set_keep_alive(Duration::from_secs(broker.keep_alive_secs));
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));
    mqtt_options.set_clean_start(true);

    Ok(mqtt_options)
}
