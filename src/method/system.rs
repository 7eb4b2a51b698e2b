// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `Shelly.*` and `Sys.*` methods.
//!
//! [`GetDeviceInfo`] and [`GetComponents`] are what a device refresh uses
//! to learn identity and capabilities.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Method, MethodRegistryBuilder, NoParams, Verb};
use crate::error::Result;

/// Response of `Shelly.GetDeviceInfo`.
///
/// # Examples
///
/// ```
/// use myhome::method::system::DeviceInfo;
///
/// let json = r#"{
///     "id": "shelly1minig3-54320464a1d0",
///     "mac": "54320464A1D0",
///     "model": "S3SW-001X8EU",
///     "gen": 3,
///     "fw_id": "20240819-074343/1.4.2-gc2639da",
///     "ver": "1.4.2",
///     "app": "Mini1G3",
///     "auth_en": false
/// }"#;
/// let info: DeviceInfo = serde_json::from_str(json).unwrap();
/// assert_eq!(info.generation, 3);
/// assert_eq!(info.app.as_deref(), Some("Mini1G3"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device id, `<model>-<mac>`.
    pub id: String,
    /// MAC address, upper-case hex without separators.
    pub mac: String,
    /// Hardware model code.
    #[serde(default)]
    pub model: String,
    /// Device generation.
    #[serde(rename = "gen", default)]
    pub generation: u32,
    /// User-assigned name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Firmware id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fw_id: Option<String>,
    /// Firmware version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ver: Option<String>,
    /// Application name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    /// Whether authentication is enabled.
    #[serde(default)]
    pub auth_en: bool,
    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `Shelly.GetDeviceInfo`.
#[derive(Debug)]
pub struct GetDeviceInfo;

impl Method for GetDeviceInfo {
    const NAME: &'static str = "Shelly.GetDeviceInfo";
    const VERB: Verb = Verb::Get;
    type Params = GetDeviceInfoParams;
    type Response = DeviceInfo;
}

/// Params of `Shelly.GetDeviceInfo`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetDeviceInfoParams {
    /// Include WiFi and cloud identifiers.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ident: bool,
}

/// One entry of `Shelly.GetComponents`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    /// Component key, e.g. `switch:0`.
    pub key: String,
    /// Component status, when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
    /// Component config, when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

/// Response of `Shelly.GetComponents`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Components {
    /// Components on this page.
    #[serde(default)]
    pub components: Vec<Component>,
    /// Offset of this page.
    #[serde(default)]
    pub offset: u32,
    /// Total number of components.
    #[serde(default)]
    pub total: u32,
}

impl Components {
    /// Returns the component keys.
    #[must_use]
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.components.iter().map(|c| c.key.as_str())
    }
}

/// Params of `Shelly.GetComponents`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetComponentsParams {
    /// Page offset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
    /// Include `status` or `config` blocks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
}

/// `Shelly.GetComponents`.
#[derive(Debug)]
pub struct GetComponents;

impl Method for GetComponents {
    const NAME: &'static str = "Shelly.GetComponents";
    const VERB: Verb = Verb::Get;
    type Params = GetComponentsParams;
    type Response = Components;
}

/// `Shelly.GetStatus`. The response is keyed by component.
#[derive(Debug)]
pub struct GetStatus;

impl Method for GetStatus {
    const NAME: &'static str = "Shelly.GetStatus";
    const VERB: Verb = Verb::Get;
    type Params = NoParams;
    type Response = Map<String, Value>;
}

/// `Shelly.GetConfig`. The response is keyed by component.
#[derive(Debug)]
pub struct GetConfig;

impl Method for GetConfig {
    const NAME: &'static str = "Shelly.GetConfig";
    const VERB: Verb = Verb::Get;
    type Params = NoParams;
    type Response = Map<String, Value>;
}

/// Params of `Shelly.Reboot`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RebootParams {
    /// Delay before rebooting, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u32>,
}

/// `Shelly.Reboot`.
#[derive(Debug)]
pub struct Reboot;

impl Method for Reboot {
    const NAME: &'static str = "Shelly.Reboot";
    const VERB: Verb = Verb::Post;
    type Params = RebootParams;
    type Response = Option<Value>;
}

/// `Sys.GetConfig`.
#[derive(Debug)]
pub struct SysGetConfig;

impl Method for SysGetConfig {
    const NAME: &'static str = "Sys.GetConfig";
    const VERB: Verb = Verb::Get;
    type Params = NoParams;
    type Response = Map<String, Value>;
}

/// Params of `Sys.SetConfig`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SysSetConfigParams {
    /// Partial `sys` configuration.
    pub config: Map<String, Value>,
}

/// Response of every `*.SetConfig` method.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetConfigResponse {
    /// Whether the change only applies after a reboot.
    #[serde(default)]
    pub restart_required: bool,
}

/// `Sys.SetConfig`.
#[derive(Debug)]
pub struct SysSetConfig;

impl Method for SysSetConfig {
    const NAME: &'static str = "Sys.SetConfig";
    const VERB: Verb = Verb::Post;
    type Params = SysSetConfigParams;
    type Response = SetConfigResponse;
}

pub(crate) fn register(builder: &mut MethodRegistryBuilder) -> Result<()> {
    builder.register_method::<GetDeviceInfo>()?;
    builder.register_method::<GetComponents>()?;
    builder.register_method::<GetStatus>()?;
    builder.register_method::<GetConfig>()?;
    builder.register_method::<Reboot>()?;
    builder.register_method::<SysGetConfig>()?;
    builder.register_method::<SysSetConfig>()
}
