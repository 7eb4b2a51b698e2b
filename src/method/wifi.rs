// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `WiFi.*` methods.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::system::SetConfigResponse;
use super::{Method, MethodRegistryBuilder, NoParams, Verb};
use crate::error::Result;

/// `WiFi.GetConfig`.
#[derive(Debug)]
pub struct GetConfig;

impl Method for GetConfig {
    const NAME: &'static str = "WiFi.GetConfig";
    const VERB: Verb = Verb::Get;
    type Params = NoParams;
    type Response = Map<String, Value>;
}

/// Params of `WiFi.SetConfig`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetConfigParams {
    /// Partial WiFi configuration.
    pub config: Map<String, Value>,
}

/// `WiFi.SetConfig`.
#[derive(Debug)]
pub struct SetConfig;

impl Method for SetConfig {
    const NAME: &'static str = "WiFi.SetConfig";
    const VERB: Verb = Verb::Post;
    type Params = SetConfigParams;
    type Response = SetConfigResponse;
}

/// Response of `WiFi.GetStatus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WifiStatus {
    /// Station IP, when connected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sta_ip: Option<String>,
    /// Connection state, e.g. `got ip`.
    #[serde(default)]
    pub status: String,
    /// Connected SSID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssid: Option<String>,
    /// Signal strength in dBm.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,
}

/// `WiFi.GetStatus`.
#[derive(Debug)]
pub struct GetStatus;

impl Method for GetStatus {
    const NAME: &'static str = "WiFi.GetStatus";
    const VERB: Verb = Verb::Get;
    type Params = NoParams;
    type Response = WifiStatus;
}

/// One access point found by `WiFi.Scan`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessPoint {
    /// Network name; absent for hidden networks.
    #[serde(default)]
    pub ssid: Option<String>,
    /// Access point MAC.
    #[serde(default)]
    pub bssid: String,
    /// Authentication mode code.
    #[serde(default)]
    pub auth: u8,
    /// Radio channel.
    #[serde(default)]
    pub channel: u8,
    /// Signal strength in dBm.
    #[serde(default)]
    pub rssi: i32,
}

/// Response of `WiFi.Scan`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResponse {
    /// Access points in range.
    #[serde(default)]
    pub results: Vec<AccessPoint>,
}

/// `WiFi.Scan`. Scanning changes radio state, so it is not a GET.
#[derive(Debug)]
pub struct Scan;

impl Method for Scan {
    const NAME: &'static str = "WiFi.Scan";
    const VERB: Verb = Verb::Post;
    type Params = NoParams;
    type Response = ScanResponse;
}

pub(crate) fn register(builder: &mut MethodRegistryBuilder) -> Result<()> {
    builder.register_method::<GetConfig>()?;
    builder.register_method::<SetConfig>()?;
    builder.register_method::<GetStatus>()?;
    builder.register_method::<Scan>()
}
