// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `Mqtt.*` methods: the device's own broker connection.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::system::SetConfigResponse;
use super::{Method, MethodRegistryBuilder, NoParams, Verb};
use crate::error::Result;

/// Response of `Mqtt.GetConfig`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Whether MQTT is enabled on the device.
    #[serde(default)]
    pub enable: bool,
    /// Broker `host:port`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    /// Client id the device uses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Topic prefix; defaults to the device id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_prefix: Option<String>,
    /// Whether RPC over MQTT is enabled.
    #[serde(default)]
    pub rpc_ntf: bool,
    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `Mqtt.GetConfig`.
#[derive(Debug)]
pub struct GetConfig;

impl Method for GetConfig {
    const NAME: &'static str = "Mqtt.GetConfig";
    const VERB: Verb = Verb::Get;
    type Params = NoParams;
    type Response = MqttConfig;
}

/// Params of `Mqtt.SetConfig`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetConfigParams {
    /// Partial MQTT configuration.
    pub config: Map<String, Value>,
}

/// `Mqtt.SetConfig`.
#[derive(Debug)]
pub struct SetConfig;

impl Method for SetConfig {
    const NAME: &'static str = "Mqtt.SetConfig";
    const VERB: Verb = Verb::Post;
    type Params = SetConfigParams;
    type Response = SetConfigResponse;
}

/// Response of `Mqtt.GetStatus`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttStatus {
    /// Whether the device is connected to its broker.
    #[serde(default)]
    pub connected: bool,
}

/// `Mqtt.GetStatus`.
#[derive(Debug)]
pub struct GetStatus;

impl Method for GetStatus {
    const NAME: &'static str = "Mqtt.GetStatus";
    const VERB: Verb = Verb::Get;
    type Params = NoParams;
    type Response = MqttStatus;
}

pub(crate) fn register(builder: &mut MethodRegistryBuilder) -> Result<()> {
    builder.register_method::<GetConfig>()?;
    builder.register_method::<SetConfig>()?;
    builder.register_method::<GetStatus>()
}
