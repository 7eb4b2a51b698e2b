// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use serde_json::Value;

use super::{Channel, Device};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::method::{Descriptor, Method, MethodRegistry, ResultSlot};
use crate::protocol::{HttpChannel, MqttChannel, RateLimiter};

enum Route<'a> {
    Http,
    Mqtt(&'a MqttChannel),
}

/// Routes device calls to a transport.
///
/// Holds the sealed method table, both channels and the rate limiter.
/// There is one per process; the registry hands devices a weak reference.
#[derive(Debug)]
pub struct Dispatcher {
    methods: Arc<MethodRegistry>,
    http: HttpChannel,
    mqtt: Option<MqttChannel>,
    limiter: RateLimiter,
}

impl Dispatcher {
    /// Creates a dispatcher. Without an MQTT channel, devices lacking a
    /// reachable host are unreachable.
    #[must_use]
    pub fn new(
        methods: Arc<MethodRegistry>,
        http: HttpChannel,
        mqtt: Option<MqttChannel>,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            methods,
            http,
            mqtt,
            limiter,
        }
    }

    /// Returns the method table.
    #[must_use]
    pub fn methods(&self) -> &MethodRegistry {
        &self.methods
    }

    /// Returns the MQTT channel, if any.
    #[must_use]
    pub fn mqtt(&self) -> Option<&MqttChannel> {
        self.mqtt.as_ref()
    }

    /// Returns the rate limiter.
    #[must_use]
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Calls a typed method on `device`.
    ///
    /// # Errors
    ///
    /// - [`Error::MethodUnknown`] if `M` was never registered
    /// - [`Error::BadRequest`] if the params fail to serialize
    /// - any error of [`call_value`](Self::call_value)
    pub async fn call<M: Method>(
        &self,
        ctx: &Context,
        device: &Device,
        channel: Channel,
        params: &M::Params,
    ) -> Result<M::Response> {
        let descriptor = self.methods.lookup(M::NAME)?;
        if !descriptor.responds_with::<M::Response>() {
            return Err(Error::Internal(format!(
                "{} is registered with a different response type",
                M::NAME
            )));
        }
        let params = serde_json::to_value(params)
            .map_err(|e| Error::BadRequest(format!("{}: {e}", M::NAME)))?;

        let slot = self.dispatch(ctx, device, channel, descriptor, &params).await?;
        slot.into_any()
            .downcast::<Option<M::Response>>()
            .ok()
            .and_then(|response| *response)
            .ok_or_else(|| Error::Internal(format!("{} response container mismatch", M::NAME)))
    }

    /// Calls a method by name with JSON params.
    ///
    /// # Errors
    ///
    /// - [`Error::MethodUnknown`] for an unregistered name
    /// - [`Error::Unreachable`] if no channel is viable
    /// - [`Error::Cancelled`], [`Error::Timeout`], [`Error::Transport`] or
    ///   [`Error::Remote`] from the transport
    pub async fn call_value(
        &self,
        ctx: &Context,
        device: &Device,
        channel: Channel,
        method: &str,
        params: Value,
    ) -> Result<Box<dyn ResultSlot>> {
        let descriptor = self.methods.lookup(method)?;
        self.dispatch(ctx, device, channel, descriptor, &params)
            .await
    }

    async fn dispatch(
        &self,
        ctx: &Context,
        device: &Device,
        channel: Channel,
        descriptor: &Descriptor,
        params: &Value,
    ) -> Result<Box<dyn ResultSlot>> {
        let route = self.select(device, channel).await?;
        let device_id = device.id();
        self.limiter.wait(ctx, &device_id).await?;

        match route {
            Route::Http => {
                tracing::debug!(device = %device_id, method = descriptor.name(), "Calling over HTTP");
                self.http.call(ctx, device, descriptor, params).await
            }
            Route::Mqtt(mqtt) => {
                tracing::debug!(device = %device_id, method = descriptor.name(), "Calling over MQTT");
                mqtt.call(ctx, &device_id, descriptor, params).await
            }
        }
    }

    async fn select(&self, device: &Device, channel: Channel) -> Result<Route<'_>> {
        let has_host = !device.host().is_empty();
        let route = match channel {
            Channel::Http if has_host => Some(Route::Http),
            Channel::Http => None,
            Channel::Default if has_host && device.http_ready() => Some(Route::Http),
            Channel::Mqtt | Channel::Default => self.mqtt_route(device).await,
        };
        route.ok_or_else(|| Error::Unreachable(device.id()))
    }

    /// Sets up MQTT for `device`. A successful setup is kept; a failed one
    /// is retried by the next call.
    async fn mqtt_route(&self, device: &Device) -> Option<Route<'_>> {
        let mqtt = self.mqtt.as_ref()?;
        if device.mqtt_ready() {
            return Some(Route::Mqtt(mqtt));
        }
        let setup = device
            .mqtt_setup
            .get_or_try_init(|| async {
                mqtt.start().await?;
                device.set_mqtt_ready(true);
                Ok::<(), Error>(())
            })
            .await;
        match setup {
            Ok(_) => Some(Route::Mqtt(mqtt)),
            Err(e) => {
                tracing::warn!(device = %device.id(), error = %e, "MQTT setup failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use crate::device::DeviceRecord;
    use crate::error::ProtocolError;
    use crate::method::switch;
    use crate::protocol::{
        HttpConfig, MemoryBroker, MemoryClient, MqttChannelConfig, MqttMessage, MqttTransport,
    };

    /// A broker connection that refuses to connect while `up` is false.
    #[derive(Debug)]
    struct FlakyTransport {
        inner: MemoryClient,
        up: Arc<AtomicBool>,
    }

    #[async_trait]
    impl MqttTransport for FlakyTransport {
        fn client_id(&self) -> &str {
            self.inner.client_id()
        }

        async fn connect(&self) -> std::result::Result<(), ProtocolError> {
            if !self.up.load(Ordering::Acquire) {
                return Err(ProtocolError::ConnectionFailed("broker is down".to_string()));
            }
            self.inner.connect().await
        }

        async fn publish(&self, topic: &str, payload: Vec<u8>) -> std::result::Result<(), ProtocolError> {
            self.inner.publish(topic, payload).await
        }

        async fn subscribe(
            &self,
            filter: &str,
        ) -> std::result::Result<mpsc::Receiver<MqttMessage>, ProtocolError> {
            self.inner.subscribe(filter).await
        }

        async fn close(&self) -> std::result::Result<(), ProtocolError> {
            self.inner.close().await
        }
    }

    fn dispatcher(mqtt: Option<MqttChannel>) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            Arc::new(MethodRegistry::standard().unwrap()),
            HttpChannel::new(&HttpConfig::new()).unwrap(),
            mqtt,
            RateLimiter::new(Duration::ZERO),
        ))
    }

    #[tokio::test]
    async fn no_host_no_mqtt_is_unreachable() {
        let dispatcher = dispatcher(None);
        let device = Device::new(DeviceRecord::new("d2"));
        device.attach(&dispatcher);
        let err = device
            .call::<switch::Toggle>(&Context::new(), Channel::Default, &switch::SwitchId { id: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unreachable(id) if id == "d2"));
    }

    #[tokio::test]
    async fn explicit_http_without_host_is_unreachable() {
        let dispatcher = dispatcher(None);
        let device = Device::new(DeviceRecord::new("d1"));
        device.attach(&dispatcher);
        let err = device
            .call_value(&Context::new(), Channel::Http, "Switch.Toggle", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unreachable(_)));
    }

    #[tokio::test]
    async fn unknown_method_is_rejected_before_routing() {
        let dispatcher = dispatcher(None);
        let device = Device::new(DeviceRecord::new("d1"));
        device.attach(&dispatcher);
        let err = device
            .call_value(&Context::new(), Channel::Default, "Cover.Open", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MethodUnknown(_)));
    }

    #[tokio::test]
    async fn mqtt_setup_marks_device_ready() {
        let broker = MemoryBroker::new();
        let channel = MqttChannel::new(
            Arc::new(broker.client("myhome_dispatch")),
            MqttChannelConfig::default(),
        );
        let dispatcher = dispatcher(Some(channel));
        let device = Device::new(DeviceRecord::new("d3"));
        device.attach(&dispatcher);

        assert!(dispatcher.select(&device, Channel::Default).await.is_ok());
        assert!(device.mqtt_ready());
        assert_eq!(broker.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_mqtt_setup_is_retried() {
        let broker = MemoryBroker::new();
        let up = Arc::new(AtomicBool::new(false));
        let transport = FlakyTransport {
            inner: broker.client("myhome_dispatch"),
            up: Arc::clone(&up),
        };
        let channel = MqttChannel::new(Arc::new(transport), MqttChannelConfig::default());
        let dispatcher = dispatcher(Some(channel));
        let device = Device::new(DeviceRecord::new("d4"));
        device.attach(&dispatcher);

        let err = device
            .call::<switch::Toggle>(&Context::new(), Channel::Default, &switch::SwitchId { id: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unreachable(id) if id == "d4"));
        assert!(!device.mqtt_ready());

        up.store(true, Ordering::Release);
        let ctx = Context::new().with_timeout(Duration::from_millis(200));
        let err = device
            .call::<switch::Toggle>(&ctx, Channel::Default, &switch::SwitchId { id: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(device.mqtt_ready());
        assert_eq!(broker.publish_times("d4/rpc").len(), 1);
    }
}
