// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT broker connection shared by every device in the process.
//!
//! The connection is established lazily on the first [`connect`] and
//! reused afterwards. When no broker URL is configured, the broker is
//! located by DNS name `mqtt`, then by an mDNS browse for `_mqtt._tcp`.
//!
//! # Examples
//!
//! ```no_run
//! use myhome::protocol::{MqttBroker, MqttTransport};
//!
//! # async fn example() -> Result<(), myhome::ProtocolError> {
//! let broker = MqttBroker::builder()
//!     .url("mqtt://192.168.1.50:1883")
//!     .credentials("user", "password")
//!     .build()?;
//!
//! // Nothing happens on the network until the first connect.
//! broker.connect().await?;
//! assert!(broker.is_connected());
//!
//! broker.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`connect`]: MqttTransport::connect

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use tokio::sync::{Mutex, mpsc, oneshot};

use super::{DEFAULT_MQTT_PORT, MqttMessage, MqttTransport, parse_broker_url, topic_matches};
use crate::error::ProtocolError;

/// Global counter for generating unique client IDs.
static BROKER_CLIENT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

const SUBSCRIPTION_BUFFER: usize = 256;

/// Configuration for an MQTT broker connection.
#[derive(Debug, Clone)]
pub struct MqttBrokerConfig {
    url: Option<String>,
    credentials: Option<(String, String)>,
    keep_alive: Duration,
    connection_timeout: Duration,
    mdns_timeout: Duration,
    client_id_prefix: String,
}

impl Default for MqttBrokerConfig {
    fn default() -> Self {
        Self {
            url: None,
            credentials: None,
            keep_alive: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
            mdns_timeout: Duration::from_secs(5),
            client_id_prefix: "myhome".to_string(),
        }
    }
}

/// Resolves the broker address.
///
/// Tries, in order: the explicit URL; a DNS lookup of the host `mqtt`; an
/// mDNS browse for `_mqtt._tcp.local.` bounded by `mdns_timeout`.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidAddress`] for a malformed explicit URL,
/// or [`ProtocolError::ConnectionFailed`] when no broker can be found.
pub async fn resolve_broker_url(
    explicit: Option<&str>,
    mdns_timeout: Duration,
) -> Result<(String, u16), ProtocolError> {
    if let Some(url) = explicit.filter(|u| !u.is_empty()) {
        return parse_broker_url(url);
    }

    match tokio::net::lookup_host(("mqtt", DEFAULT_MQTT_PORT)).await {
        Ok(mut addrs) => {
            if let Some(addr) = addrs.next() {
                tracing::info!(broker = %addr, "Found MQTT broker by host name");
                return Ok((addr.ip().to_string(), addr.port()));
            }
        }
        Err(e) => tracing::debug!(error = %e, "No `mqtt` host in DNS"),
    }

    crate::discovery::resolve_broker_via_mdns(mdns_timeout)
        .await
        .ok_or_else(|| {
            ProtocolError::ConnectionFailed(
                "no MQTT broker configured, resolvable as `mqtt`, or advertised over mDNS"
                    .to_string(),
            )
        })
}

/// The process-wide MQTT connection.
///
/// `MqttBroker` is cheaply cloneable (via `Arc`); clones share the
/// connection and its subscriptions.
#[derive(Clone)]
pub struct MqttBroker {
    inner: Arc<MqttBrokerInner>,
}

struct MqttBrokerInner {
    config: MqttBrokerConfig,
    client_id: String,
    client: RwLock<Option<AsyncClient>>,
    connect_lock: Mutex<()>,
    subscriptions: RwLock<Vec<(String, mpsc::Sender<MqttMessage>)>>,
    connected: AtomicBool,
    generation: AtomicU64,
}

impl MqttBrokerInner {
    fn route_message(&self, message: &MqttMessage) {
        let subscriptions = self.subscriptions.read();
        for (filter, tx) in subscriptions.iter() {
            if !topic_matches(filter, &message.topic) {
                continue;
            }
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(message.clone()) {
                tracing::warn!(
                    topic = %message.topic,
                    filter = %filter,
                    "Subscriber lagging, MQTT message dropped"
                );
            }
        }
    }

    /// Tears down connection state if `generation` is still current.
    fn connection_lost(&self, generation: u64) {
        if self.generation.load(Ordering::Acquire) != generation {
            return;
        }
        self.connected.store(false, Ordering::Release);
        self.client.write().take();
        // dropping the senders ends every subscription stream
        self.subscriptions.write().clear();
    }
}

impl MqttBroker {
    /// Creates a new builder for configuring an MQTT broker connection.
    #[must_use]
    pub fn builder() -> MqttBrokerBuilder {
        MqttBrokerBuilder::default()
    }

    /// Returns whether the broker is currently connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Returns whether authentication is configured.
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        self.inner.config.credentials.is_some()
    }

    /// Returns the number of active subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.read().len()
    }

    fn client(&self) -> Result<AsyncClient, ProtocolError> {
        self.inner.client.read().clone().ok_or_else(|| {
            ProtocolError::ConnectionFailed("not connected to MQTT broker".to_string())
        })
    }

    async fn establish(&self) -> Result<(), ProtocolError> {
        let config = &self.inner.config;
        let (host, port) = resolve_broker_url(config.url.as_deref(), config.mdns_timeout).await?;

        let mut mqtt_options = MqttOptions::new(&self.inner.client_id, &host, port);
        mqtt_options.set_keep_alive(config.keep_alive);
        mqtt_options.set_clean_session(true);
        if let Some((ref username, ref password)) = config.credentials {
            mqtt_options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(mqtt_options, 64);
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;

        // Channel to signal when ConnAck is received
        let (connack_tx, connack_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            handle_broker_events(event_loop, inner, generation, connack_tx).await;
        });

        match tokio::time::timeout(config.connection_timeout, connack_rx).await {
            Ok(Ok(())) => {
                *self.inner.client.write() = Some(client);
                self.inner.connected.store(true, Ordering::Release);
                tracing::info!(
                    host = %host,
                    port = %port,
                    client_id = %self.inner.client_id,
                    "Connected to MQTT broker"
                );
                Ok(())
            }
            Ok(Err(_)) => Err(ProtocolError::ConnectionFailed(format!(
                "MQTT broker {host}:{port} refused or closed the connection"
            ))),
            Err(_) => {
                let _ = client.try_disconnect();
                Err(ProtocolError::ConnectionFailed(format!(
                    "MQTT connection timeout after {}s",
                    config.connection_timeout.as_secs()
                )))
            }
        }
    }
}

#[async_trait]
impl MqttTransport for MqttBroker {
    fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    async fn connect(&self) -> Result<(), ProtocolError> {
        if self.is_connected() {
            return Ok(());
        }
        // later callers wait here for the first one's ConnAck
        let _guard = self.inner.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        self.establish().await
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ProtocolError> {
        let client = self.client()?;
        tracing::debug!(topic = %topic, bytes = payload.len(), "Publishing MQTT message");
        client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(ProtocolError::Mqtt)
    }

    async fn subscribe(&self, filter: &str) -> Result<mpsc::Receiver<MqttMessage>, ProtocolError> {
        let client = self.client()?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        // register first so nothing published right after the SUBACK is lost
        self.inner
            .subscriptions
            .write()
            .push((filter.to_string(), tx));
        client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(ProtocolError::Mqtt)?;
        tracing::debug!(filter = %filter, "Subscribed to MQTT topic");
        Ok(rx)
    }

    async fn close(&self) -> Result<(), ProtocolError> {
        let client = self.inner.client.write().take();
        self.inner.connected.store(false, Ordering::Release);
        self.inner.subscriptions.write().clear();
        if let Some(client) = client {
            tracing::info!(client_id = %self.inner.client_id, "Disconnecting from MQTT broker");
            client.disconnect().await.map_err(ProtocolError::Mqtt)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for MqttBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttBroker")
            .field("url", &self.inner.config.url)
            .field("client_id", &self.inner.client_id)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

/// Builder for the process-wide MQTT connection.
///
/// # Examples
///
/// ```
/// use myhome::protocol::{MqttBroker, MqttTransport};
/// use std::time::Duration;
///
/// let broker = MqttBroker::builder()
///     .url("mqtt://192.168.1.50:1883")
///     .keep_alive(Duration::from_secs(60))
///     .connection_timeout(Duration::from_secs(5))
///     .build()
///     .unwrap();
/// assert!(broker.client_id().starts_with("myhome_"));
/// assert!(!broker.is_connected());
/// ```
#[derive(Debug, Default)]
pub struct MqttBrokerBuilder {
    config: MqttBrokerConfig,
}

impl MqttBrokerBuilder {
    /// Sets an explicit broker URL, skipping DNS and mDNS lookup.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = Some(url.into());
        self
    }

    /// Sets an explicit broker URL if one is given.
    #[must_use]
    pub fn maybe_url(mut self, url: Option<String>) -> Self {
        self.config.url = url.filter(|u| !u.is_empty());
        self
    }

    /// Sets authentication credentials.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.credentials = Some((username.into(), password.into()));
        self
    }

    /// Sets the keep-alive interval (default: 30 seconds).
    #[must_use]
    pub fn keep_alive(mut self, duration: Duration) -> Self {
        self.config.keep_alive = duration;
        self
    }

    /// Sets how long to wait for the broker's ConnAck (default: 10 seconds).
    #[must_use]
    pub fn connection_timeout(mut self, duration: Duration) -> Self {
        self.config.connection_timeout = duration;
        self
    }

    /// Sets the mDNS browse window used when no URL is given (default: 5 seconds).
    #[must_use]
    pub fn mdns_timeout(mut self, duration: Duration) -> Self {
        self.config.mdns_timeout = duration;
        self
    }

    /// Sets the client id prefix (default: `myhome`).
    #[must_use]
    pub fn client_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.client_id_prefix = prefix.into();
        self
    }

    /// Builds the broker handle without connecting.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidAddress`] if an explicit URL is
    /// malformed.
    pub fn build(self) -> Result<MqttBroker, ProtocolError> {
        if let Some(url) = &self.config.url {
            parse_broker_url(url)?;
        }

        let counter = BROKER_CLIENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let client_id = format!(
            "{}_{}_{}",
            self.config.client_id_prefix,
            std::process::id(),
            counter
        );

        Ok(MqttBroker {
            inner: Arc::new(MqttBrokerInner {
                config: self.config,
                client_id,
                client: RwLock::new(None),
                connect_lock: Mutex::new(()),
                subscriptions: RwLock::new(Vec::new()),
                connected: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        })
    }
}

/// Handles MQTT events for one broker connection.
async fn handle_broker_events(
    mut event_loop: EventLoop,
    inner: Arc<MqttBrokerInner>,
    generation: u64,
    connack_tx: oneshot::Sender<()>,
) {
    use rumqttc::{Event, Packet};

    let mut connack_tx = Some(connack_tx);

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                tracing::debug!(?connack, "MQTT broker connected");
                if let Some(tx) = connack_tx.take() {
                    let _ = tx.send(());
                }
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                tracing::debug!(?suback, "MQTT subscription acknowledged");
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                tracing::debug!(
                    topic = %publish.topic,
                    bytes = publish.payload.len(),
                    "MQTT message received"
                );
                inner.route_message(&MqttMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                });
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                tracing::info!("MQTT broker disconnected");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if connack_tx.is_none() {
                    tracing::error!(error = %e, "MQTT broker event loop error");
                } else {
                    tracing::debug!(error = %e, "MQTT connection attempt failed");
                }
                break;
            }
        }
    }

    inner.connection_lost(generation);
}
