// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shelly devices and the call dispatcher.
//!
//! A [`Device`] holds the registry's view of one physical device (its
//! [`DeviceRecord`]) plus transport readiness. Calls go through the
//! [`Dispatcher`], which picks a [`Channel`], waits for the per-device
//! rate limiter and decodes the answer into the method's response type.
//!
//! Devices keep only a weak handle on their dispatcher; the registry owns
//! both.
//!
//! # Channel selection
//!
//! | Requested | Picks |
//! |-----------|-------|
//! | [`Channel::Http`] | HTTP if the host is known |
//! | [`Channel::Mqtt`] | MQTT if the broker channel can be set up |
//! | [`Channel::Default`] | HTTP if host known and HTTP-ready, else MQTT |
//!
//! Anything else fails with [`Error::Unreachable`] before touching the
//! network.

mod dispatcher;

pub use dispatcher::Dispatcher;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::method::{Method, system};

/// Manufacturer recorded for devices found on the LAN.
pub const SHELLY: &str = "Shelly";

/// Transport selector for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Direct HTTP to the device's host.
    Http,
    /// Through the shared MQTT broker.
    Mqtt,
    /// HTTP when possible, MQTT otherwise.
    #[default]
    Default,
}

/// Persistent description of a device.
///
/// # Examples
///
/// ```
/// use myhome::device::DeviceRecord;
///
/// let record = DeviceRecord::new("shelly1minig3-54320464a1d0")
///     .with_name("kitchen-light")
///     .with_host("192.0.2.10")
///     .with_mac("54:32:04:64:A1:D0");
/// assert_eq!(record.normalized_mac(), "54320464a1d0");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Stable id, `<model>-<mac>`.
    pub id: String,
    /// Human name, unique when non-empty.
    #[serde(default)]
    pub name: String,
    /// Vendor.
    #[serde(default)]
    pub manufacturer: String,
    /// Hardware model or application name.
    #[serde(default)]
    pub model: String,
    /// Device generation.
    #[serde(default, rename = "gen")]
    pub generation: u32,
    /// IPv4 host, or empty when only reachable over MQTT.
    #[serde(default)]
    pub host: String,
    /// MAC address as reported.
    #[serde(default)]
    pub mac: String,
    /// Last time discovery or a refresh saw the device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    /// Component keys the device reported, e.g. `switch:0`.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Room the device is placed in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    /// Groups the device belongs to.
    #[serde(default)]
    pub groups: BTreeSet<String>,
    /// Last `Shelly.GetDeviceInfo` answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
}

impl DeviceRecord {
    /// Creates a record with only an id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            manufacturer: SHELLY.to_string(),
            model: String::new(),
            generation: 0,
            host: String::new(),
            mac: String::new(),
            last_seen: None,
            capabilities: BTreeSet::new(),
            room_id: None,
            groups: BTreeSet::new(),
            info: None,
        }
    }

    /// Sets the name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the MAC address.
    #[must_use]
    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.mac = mac.into();
        self
    }

    /// Sets the model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Sets the room.
    #[must_use]
    pub fn with_room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    /// Returns the MAC lower-cased without separators.
    #[must_use]
    pub fn normalized_mac(&self) -> String {
        normalize_mac(&self.mac)
    }
}

/// Lower-cases a MAC address and strips `:` and `-`.
#[must_use]
pub fn normalize_mac(mac: &str) -> String {
    mac.chars()
        .filter(|c| *c != ':' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

/// A device as seen at runtime.
///
/// Created by the registry, which attaches the dispatcher used by
/// [`call`](Self::call) and [`refresh`](Self::refresh).
#[derive(Debug)]
pub struct Device {
    record: RwLock<DeviceRecord>,
    http_ready: AtomicBool,
    mqtt_ready: AtomicBool,
    mqtt_setup: tokio::sync::OnceCell<()>,
    dispatcher: OnceLock<Weak<Dispatcher>>,
}

impl Device {
    /// Wraps a record. HTTP is considered ready when a host is known.
    #[must_use]
    pub fn new(record: DeviceRecord) -> Self {
        let http_ready = !record.host.is_empty();
        Self {
            record: RwLock::new(record),
            http_ready: AtomicBool::new(http_ready),
            mqtt_ready: AtomicBool::new(false),
            mqtt_setup: tokio::sync::OnceCell::new(),
            dispatcher: OnceLock::new(),
        }
    }

    /// Attaches the dispatcher. Only the first attach takes effect.
    pub fn attach(&self, dispatcher: &Arc<Dispatcher>) {
        let _ = self.dispatcher.set(Arc::downgrade(dispatcher));
    }

    fn dispatcher(&self) -> Result<Arc<Dispatcher>> {
        self.dispatcher
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::Internal(format!("device {} has no dispatcher", self.id())))
    }

    /// Returns the id.
    #[must_use]
    pub fn id(&self) -> String {
        self.record.read().id.clone()
    }

    /// Returns the name.
    #[must_use]
    pub fn name(&self) -> String {
        self.record.read().name.clone()
    }

    /// Returns the host, empty if unknown.
    #[must_use]
    pub fn host(&self) -> String {
        self.record.read().host.clone()
    }

    /// Returns a snapshot of the record.
    #[must_use]
    pub fn record(&self) -> DeviceRecord {
        self.record.read().clone()
    }

    /// Applies `f` to the record.
    pub fn update<R>(&self, f: impl FnOnce(&mut DeviceRecord) -> R) -> R {
        f(&mut self.record.write())
    }

    /// Sets a new host and marks HTTP ready.
    pub fn set_host(&self, host: impl Into<String>) {
        let host = host.into();
        let ready = !host.is_empty();
        self.record.write().host = host;
        self.http_ready.store(ready, Ordering::Release);
    }

    /// Forgets the host after HTTP failed; later calls go over MQTT until
    /// discovery sees the device again.
    pub fn clear_host(&self) {
        let previous = std::mem::take(&mut self.record.write().host);
        self.http_ready.store(false, Ordering::Release);
        if !previous.is_empty() {
            tracing::info!(device = %self.id(), host = %previous, "Cleared device host");
        }
    }

    /// Returns whether HTTP may be used by default.
    #[must_use]
    pub fn http_ready(&self) -> bool {
        self.http_ready.load(Ordering::Acquire)
    }

    /// Sets HTTP readiness.
    pub fn set_http_ready(&self, ready: bool) {
        self.http_ready.store(ready, Ordering::Release);
    }

    /// Returns whether MQTT has been set up for this device.
    #[must_use]
    pub fn mqtt_ready(&self) -> bool {
        self.mqtt_ready.load(Ordering::Acquire)
    }

    /// Sets MQTT readiness.
    pub fn set_mqtt_ready(&self, ready: bool) {
        self.mqtt_ready.store(ready, Ordering::Release);
    }

    /// Calls a typed method.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::call`].
    pub async fn call<M: Method>(
        &self,
        ctx: &Context,
        channel: Channel,
        params: &M::Params,
    ) -> Result<M::Response> {
        self.dispatcher()?.call::<M>(ctx, self, channel, params).await
    }

    /// Calls a method by name with JSON params and returns the decoded
    /// response re-encoded as JSON.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::call_value`].
    pub async fn call_value(
        &self,
        ctx: &Context,
        channel: Channel,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        let slot = self
            .dispatcher()?
            .call_value(ctx, self, channel, method, params)
            .await?;
        Ok(slot.to_value())
    }

    /// Re-fetches identity and components and updates the record.
    ///
    /// # Errors
    ///
    /// Returns the first failing call's error; the record is left as is.
    pub async fn refresh(&self, ctx: &Context) -> Result<DeviceRecord> {
        let info = self
            .call::<system::GetDeviceInfo>(ctx, Channel::Default, &system::GetDeviceInfoParams::default())
            .await?;
        let components = self
            .call::<system::GetComponents>(ctx, Channel::Default, &system::GetComponentsParams::default())
            .await?;

        let info_value = serde_json::to_value(&info).ok();
        let record = self.update(|record| {
            if !info.mac.is_empty() {
                record.mac.clone_from(&info.mac);
            }
            if !info.model.is_empty() {
                record.model.clone_from(&info.model);
            }
            if info.generation > 0 {
                record.generation = info.generation;
            }
            if record.name.is_empty()
                && let Some(name) = info.name.as_ref().filter(|n| !n.is_empty())
            {
                record.name.clone_from(name);
            }
            record.capabilities = components.keys().map(str::to_string).collect();
            record.info = info_value;
            record.last_seen = Some(Utc::now());
            record.clone()
        });

        tracing::debug!(
            device = %record.id,
            components = record.capabilities.len(),
            "Device refreshed"
        );
        Ok(record)
    }
}
