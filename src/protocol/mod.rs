// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transports for talking to Shelly devices.
//!
//! # Channels
//!
//! - [`HttpChannel`]: direct `http://<host>/rpc/<Method>` calls with retry
//! - [`MqttChannel`]: request/response correlation over a shared broker
//!
//! # MQTT connection
//!
//! [`MqttChannel`] sits on top of an [`MqttTransport`]. The production
//! implementation is [`MqttBroker`] (one lazily-connected `rumqttc` client
//! per process); [`MemoryBroker`] is an in-process hub with the same
//! semantics, used to run devices and callers in one test process.
//!
//! [`RateLimiter`] spaces out commands to the same device, whatever channel
//! they take.

mod correlator;
mod http;
mod memory;
mod mqtt_broker;
mod rate_limiter;

pub use correlator::{MqttChannel, MqttChannelConfig};
pub use http::{HttpChannel, HttpConfig, RetryPolicy};
pub use memory::{MemoryBroker, MemoryClient};
pub use mqtt_broker::{MqttBroker, MqttBrokerBuilder, resolve_broker_url};
pub use rate_limiter::RateLimiter;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ProtocolError;

/// Default MQTT port.
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// A message received on a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    /// Topic the message was published on.
    pub topic: String,
    /// Raw payload.
    pub payload: Vec<u8>,
}

/// A publish/subscribe connection to an MQTT broker.
///
/// A subscription stream ends when the connection to the broker is lost;
/// consumers treat end-of-stream as a transport failure.
#[async_trait]
pub trait MqttTransport: Send + Sync + std::fmt::Debug {
    /// Returns the client id of this connection.
    fn client_id(&self) -> &str;

    /// Connects to the broker, or returns immediately if already connected.
    ///
    /// Concurrent callers wait for the same connection attempt.
    async fn connect(&self) -> Result<(), ProtocolError>;

    /// Publishes `payload` on `topic`.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ProtocolError>;

    /// Subscribes to a topic filter and returns the stream of matching
    /// messages.
    async fn subscribe(&self, filter: &str) -> Result<mpsc::Receiver<MqttMessage>, ProtocolError>;

    /// Disconnects from the broker. All subscription streams end.
    async fn close(&self) -> Result<(), ProtocolError>;
}

/// Parses a broker URL into host and port.
///
/// Accepts `mqtt://host:port`, `tcp://host:port` or a bare `host[:port]`;
/// the port defaults to 1883.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidAddress`] for an empty host or a bad port.
pub fn parse_broker_url(url: &str) -> Result<(String, u16), ProtocolError> {
    let url = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url)
        .trim_end_matches('/');

    let (host, port) = if let Some((h, p)) = url.rsplit_once(':') {
        let port = p
            .parse()
            .map_err(|_| ProtocolError::InvalidAddress(format!("Invalid port: {p}")))?;
        (h.to_string(), port)
    } else {
        (url.to_string(), DEFAULT_MQTT_PORT)
    };

    if host.is_empty() {
        return Err(ProtocolError::InvalidAddress(
            "MQTT broker host is required".to_string(),
        ));
    }

    Ok((host, port))
}

/// Returns whether `topic` matches the MQTT topic `filter`.
///
/// `+` matches exactly one level, a trailing `#` matches any remainder
/// including the parent level itself.
pub(crate) fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_broker_url_with_scheme() {
        let (host, port) = parse_broker_url("mqtt://192.168.1.50:1883").unwrap();
        assert_eq!(host, "192.168.1.50");
        assert_eq!(port, 1883);
    }

    #[test]
    fn parse_broker_url_tcp_scheme() {
        let (host, port) = parse_broker_url("tcp://broker.local:8883").unwrap();
        assert_eq!(host, "broker.local");
        assert_eq!(port, 8883);
    }

    #[test]
    fn parse_broker_url_default_port() {
        let (host, port) = parse_broker_url("mqtt").unwrap();
        assert_eq!(host, "mqtt");
        assert_eq!(port, DEFAULT_MQTT_PORT);
    }

    #[test]
    fn parse_broker_url_rejects_bad_port() {
        assert!(matches!(
            parse_broker_url("mqtt://host:notaport"),
            Err(ProtocolError::InvalidAddress(_))
        ));
        assert!(parse_broker_url("mqtt://").is_err());
    }

    #[test]
    fn topic_filter_matching() {
        assert!(topic_matches("myhome_1_0/rpc", "myhome_1_0/rpc"));
        assert!(!topic_matches("myhome_1_0/rpc", "myhome_1_1/rpc"));
        assert!(topic_matches("+/rpc", "shellyplus1-a8032ab12345/rpc"));
        assert!(!topic_matches("+/rpc", "a/b/rpc"));
        assert!(topic_matches("shellies/#", "shellies/x/status/switch:0"));
        assert!(topic_matches("shellies/#", "shellies"));
        assert!(!topic_matches("shellies/+", "shellies"));
    }
}
