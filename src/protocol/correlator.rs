// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request/response correlation over MQTT.
//!
//! Every call publishes `{"id","src","method","params"}` on
//! `<device_id>/rpc`, with `src` set to this process's client id. Devices
//! answer on `<src>/rpc`, which a single dispatcher task consumes and
//! routes to the waiting caller by `id`.
//!
//! A pending entry is removed exactly once: by the dispatcher when the
//! answer arrives, or by the caller on deadline or cancellation. Answers
//! for ids no longer pending are logged and dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;

use super::{MqttMessage, MqttTransport};
use crate::context::Context;
use crate::error::{Error, ProtocolError, Result};
use crate::method::{Descriptor, ResultSlot};

const REQUEST_ID_MASK: u32 = 0x7FFF_FFFF;

/// Configuration of an [`MqttChannel`].
#[derive(Debug, Clone, Copy)]
pub struct MqttChannelConfig {
    call_timeout: Duration,
}

impl Default for MqttChannelConfig {
    fn default() -> Self {
        Self {
            call_timeout: Self::DEFAULT_CALL_TIMEOUT,
        }
    }
}

impl MqttChannelConfig {
    /// Deadline for calls whose context has none.
    pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

    /// Sets the deadline for calls whose context has none.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Returns the default call timeout.
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }
}

#[derive(Debug)]
struct Pending {
    tx: oneshot::Sender<Result<Value>>,
    device_id: String,
    method: &'static str,
    deadline: Instant,
}

#[derive(Debug, Deserialize)]
struct RemoteError {
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct Frame {
    id: Option<u32>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RemoteError>,
}

/// RPC over the shared MQTT connection.
///
/// Cloning shares the pending table and the dispatcher.
#[derive(Debug, Clone)]
pub struct MqttChannel {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    transport: Arc<dyn MqttTransport>,
    src_topic: String,
    config: MqttChannelConfig,
    pending: Mutex<HashMap<u32, Pending>>,
    drained: Notify,
    next_id: AtomicU32,
    start_lock: tokio::sync::Mutex<()>,
    listening: AtomicBool,
    closing: AtomicBool,
}

impl Inner {
    fn remove(&self, id: u32) -> Option<Pending> {
        let mut pending = self.pending.lock();
        let entry = pending.remove(&id);
        if pending.is_empty() {
            self.drained.notify_waiters();
        }
        entry
    }

    fn deliver(&self, message: &MqttMessage) {
        let frame: Frame = match serde_json::from_slice(&message.payload) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(topic = %message.topic, error = %e, "Malformed RPC response dropped");
                return;
            }
        };
        let Some(id) = frame.id else {
            tracing::debug!(topic = %message.topic, "Notification without id ignored");
            return;
        };
        let Some(pending) = self.remove(id) else {
            tracing::warn!(id, topic = %message.topic, "Response for unknown request dropped");
            return;
        };

        let outcome = match frame.error {
            Some(err) => Err(Error::Remote {
                code: err.code,
                message: err.message,
            }),
            None => Ok(frame.result.unwrap_or(Value::Null)),
        };
        tracing::debug!(
            id,
            device = %pending.device_id,
            method = pending.method,
            ok = outcome.is_ok(),
            "RPC response received"
        );
        // the caller may have given up in between; that is fine
        let _ = pending.tx.send(outcome);
    }

    fn fail_all(&self, error: impl Fn() -> Error) {
        let drained: Vec<(u32, Pending)> = self.pending.lock().drain().collect();
        self.drained.notify_waiters();
        for (id, pending) in drained {
            tracing::debug!(
                id,
                device = %pending.device_id,
                method = pending.method,
                "Failing pending RPC"
            );
            let _ = pending.tx.send(Err(error()));
        }
    }
}

/// Removes its entry from the pending table on drop.
struct PendingGuard<'a> {
    inner: &'a Inner,
    id: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.remove(self.id);
    }
}

impl MqttChannel {
    /// Creates a channel over `transport`. Nothing is sent until the first
    /// call.
    #[must_use]
    pub fn new(transport: Arc<dyn MqttTransport>, config: MqttChannelConfig) -> Self {
        let src_topic = format!("{}/rpc", transport.client_id());
        Self {
            inner: Arc::new(Inner {
                transport,
                src_topic,
                config,
                pending: Mutex::new(HashMap::new()),
                drained: Notify::new(),
                next_id: AtomicU32::new(1),
                start_lock: tokio::sync::Mutex::new(()),
                listening: AtomicBool::new(false),
                closing: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the client id, used as `src` in requests.
    #[must_use]
    pub fn client_id(&self) -> &str {
        self.inner.transport.client_id()
    }

    /// Returns the topic responses arrive on.
    #[must_use]
    pub fn src_topic(&self) -> &str {
        &self.inner.src_topic
    }

    /// Returns the number of calls awaiting a response.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Returns whether the response dispatcher is running.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::Acquire)
    }

    /// Allocates a request id. Returns the id and the counter value it left
    /// behind, which [`release_request_id`](Self::release_request_id) needs.
    fn next_request_id(&self) -> (u32, u32) {
        // 0 is skipped so ids are always truthy on the wire
        loop {
            let raw = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            let id = raw & REQUEST_ID_MASK;
            if id != 0 {
                return (id, raw.wrapping_add(1));
            }
        }
    }

    /// Hands an unused id back. Only the latest allocation can be undone;
    /// once another call has taken an id after it, the id stays skipped.
    fn release_request_id(&self, left: u32) {
        let _ = self.inner.next_id.compare_exchange(
            left,
            left.wrapping_sub(1),
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    /// Connects and subscribes to the response topic if not done yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the broker cannot be reached.
    pub async fn start(&self) -> Result<()> {
        if self.is_listening() {
            return Ok(());
        }
        let _guard = self.inner.start_lock.lock().await;
        if self.is_listening() {
            return Ok(());
        }
        if self.inner.closing.load(Ordering::Acquire) {
            return Err(ProtocolError::ChannelClosed("MQTT channel is closed".to_string()).into());
        }

        self.inner.transport.connect().await?;
        let mut responses = self.inner.transport.subscribe(&self.inner.src_topic).await?;
        self.inner.listening.store(true, Ordering::Release);
        tracing::info!(topic = %self.inner.src_topic, "MQTT RPC dispatcher started");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            while let Some(message) = responses.recv().await {
                inner.deliver(&message);
            }
            inner.listening.store(false, Ordering::Release);
            if !inner.closing.load(Ordering::Acquire) {
                tracing::warn!(topic = %inner.src_topic, "MQTT response stream ended");
            }
            inner.fail_all(|| {
                ProtocolError::ChannelClosed("MQTT connection lost".to_string()).into()
            });
        });
        Ok(())
    }

    /// Sends one request to `device_id` and waits for its response.
    ///
    /// The deadline is the context's, or the configured call timeout.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] when the deadline passes
    /// - [`Error::Cancelled`] when `ctx` is cancelled or the channel closes
    /// - [`Error::Transport`] when the connection is lost
    /// - [`Error::Remote`] when the device answers with an error
    pub async fn call(
        &self,
        ctx: &Context,
        device_id: &str,
        descriptor: &Descriptor,
        params: &Value,
    ) -> Result<Box<dyn ResultSlot>> {
        ctx.check()?;
        if self.inner.closing.load(Ordering::Acquire) {
            return Err(ProtocolError::ChannelClosed("MQTT channel is closed".to_string()).into());
        }
        self.start().await?;

        let (id, left) = self.next_request_id();
        let deadline = ctx.deadline_or(self.inner.config.call_timeout);
        let budget = deadline.saturating_duration_since(Instant::now());
        let (tx, rx) = oneshot::channel();

        self.inner.pending.lock().insert(
            id,
            Pending {
                tx,
                device_id: device_id.to_string(),
                method: descriptor.name(),
                deadline,
            },
        );
        let guard = PendingGuard {
            inner: &self.inner,
            id,
        };

        let request = serde_json::json!({
            "id": id,
            "src": self.client_id(),
            "method": descriptor.name(),
            "params": params,
        });
        let topic = format!("{device_id}/rpc");
        tracing::debug!(id, device = %device_id, method = descriptor.name(), "Publishing RPC request");

        tokio::select! {
            () = ctx.cancelled() => {
                drop(guard);
                self.release_request_id(left);
                return Err(Error::Cancelled);
            }
            published = self.inner.transport.publish(&topic, request.to_string().into_bytes()) => published?,
        }

        let outcome = tokio::select! {
            () = ctx.cancelled() => Err(Error::Cancelled),
            () = tokio::time::sleep_until(deadline) => {
                tracing::debug!(id, device = %device_id, method = descriptor.name(), "RPC timed out");
                Err(Error::Timeout(u64::try_from(budget.as_millis()).unwrap_or(u64::MAX)))
            }
            response = rx => response.unwrap_or_else(|_| {
                Err(ProtocolError::ChannelClosed("response slot dropped".to_string()).into())
            }),
        };
        drop(guard);

        descriptor.decode(outcome?)
    }

    /// Returns the earliest deadline among pending calls.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner.pending.lock().values().map(|p| p.deadline).min()
    }

    /// Stops accepting calls, lets in-flight calls finish for up to `grace`,
    /// fails the rest with [`Error::Cancelled`] and disconnects.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the disconnect itself fails.
    pub async fn close(&self, grace: Duration) -> Result<()> {
        self.inner.closing.store(true, Ordering::Release);
        let give_up_at = Instant::now() + grace;

        loop {
            let drained = self.inner.drained.notified();
            if self.pending_len() == 0 {
                break;
            }
            tokio::select! {
                () = drained => {}
                () = tokio::time::sleep_until(give_up_at) => break,
            }
        }

        let left = self.pending_len();
        if left > 0 {
            tracing::info!(pending = left, "Grace period over, cancelling pending RPCs");
        }
        self.inner.fail_all(|| Error::Cancelled);
        self.inner.transport.close().await?;
        Ok(())
    }
}
