// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-process MQTT hub.
//!
//! [`MemoryBroker`] routes publishes to subscribers of the same hub with
//! real topic-filter matching and records every publish with its
//! timestamp. Each [`MemoryClient`] behaves like one broker connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{MqttMessage, MqttTransport, topic_matches};
use crate::error::ProtocolError;

const SUBSCRIPTION_BUFFER: usize = 256;

/// An in-process broker.
///
/// # Examples
///
/// ```
/// use myhome::protocol::{MemoryBroker, MqttTransport};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), myhome::ProtocolError> {
/// let broker = MemoryBroker::new();
/// let device = broker.client("shellyplus1-a8032ab12345");
/// let caller = broker.client("myhome_1_0");
/// device.connect().await?;
/// caller.connect().await?;
///
/// let mut inbox = device.subscribe("shellyplus1-a8032ab12345/rpc").await?;
/// caller.publish("shellyplus1-a8032ab12345/rpc", b"{}".to_vec()).await?;
/// assert_eq!(inbox.recv().await.unwrap().payload, b"{}");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    hub: Arc<Hub>,
}

#[derive(Debug, Default)]
struct Hub {
    subscribers: Mutex<Vec<Subscriber>>,
    log: Mutex<Vec<(Instant, MqttMessage)>>,
    connects: AtomicUsize,
}

#[derive(Debug)]
struct Subscriber {
    client_id: String,
    filter: String,
    tx: mpsc::Sender<MqttMessage>,
}

impl MemoryBroker {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a client connection with the given id.
    #[must_use]
    pub fn client(&self, client_id: impl Into<String>) -> MemoryClient {
        MemoryClient {
            broker: self.clone(),
            client_id: client_id.into(),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns every message published so far, with its publish time.
    #[must_use]
    pub fn published(&self) -> Vec<(Instant, MqttMessage)> {
        self.hub.log.lock().clone()
    }

    /// Returns the publish times of messages on `topic`.
    #[must_use]
    pub fn publish_times(&self, topic: &str) -> Vec<Instant> {
        self.hub
            .log
            .lock()
            .iter()
            .filter(|(_, m)| m.topic == topic)
            .map(|(at, _)| *at)
            .collect()
    }

    /// Returns how many times any client connected.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.hub.connects.load(Ordering::Acquire)
    }

    /// Simulates the broker going away: every subscription stream ends.
    pub fn drop_connections(&self) {
        let dropped = std::mem::take(&mut *self.hub.subscribers.lock());
        tracing::debug!(subscriptions = dropped.len(), "Memory broker dropped all connections");
    }

    fn deliver(&self, message: &MqttMessage) {
        self.hub
            .log
            .lock()
            .push((Instant::now(), message.clone()));

        let mut subscribers = self.hub.subscribers.lock();
        subscribers.retain(|sub| {
            if !topic_matches(&sub.filter, &message.topic) {
                return true;
            }
            match sub.tx.try_send(message.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        client = %sub.client_id,
                        topic = %message.topic,
                        "Subscriber buffer full, message dropped"
                    );
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

/// One connection to a [`MemoryBroker`].
#[derive(Debug, Clone)]
pub struct MemoryClient {
    broker: MemoryBroker,
    client_id: String,
    connected: Arc<AtomicBool>,
}

impl MemoryClient {
    fn ensure_connected(&self) -> Result<(), ProtocolError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ProtocolError::ConnectionFailed(format!(
                "{} is not connected",
                self.client_id
            )))
        }
    }
}

#[async_trait]
impl MqttTransport for MemoryClient {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn connect(&self) -> Result<(), ProtocolError> {
        if !self.connected.swap(true, Ordering::AcqRel) {
            self.broker.hub.connects.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ProtocolError> {
        self.ensure_connected()?;
        self.broker.deliver(&MqttMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<mpsc::Receiver<MqttMessage>, ProtocolError> {
        self.ensure_connected()?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.broker.hub.subscribers.lock().push(Subscriber {
            client_id: self.client_id.clone(),
            filter: filter.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn close(&self) -> Result<(), ProtocolError> {
        self.connected.store(false, Ordering::Release);
        self.broker
            .hub
            .subscribers
            .lock()
            .retain(|sub| sub.client_id != self.client_id);
        Ok(())
    }
}
