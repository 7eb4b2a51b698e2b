// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `Switch.*` methods.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::system::SetConfigResponse;
use super::{Method, MethodRegistryBuilder, Verb};
use crate::error::Result;

/// Params addressing one switch component.
///
/// # Examples
///
/// ```
/// use myhome::method::switch::SwitchId;
///
/// let body = serde_json::to_string(&SwitchId { id: 0 }).unwrap();
/// assert_eq!(body, r#"{"id":0}"#);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchId {
    /// Switch component index.
    pub id: u32,
}

/// Response of `Switch.Toggle` and `Switch.Set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToggleResponse {
    /// Output state before the command.
    pub was_on: bool,
}

/// `Switch.Toggle`.
#[derive(Debug)]
pub struct Toggle;

impl Method for Toggle {
    const NAME: &'static str = "Switch.Toggle";
    const VERB: Verb = Verb::Post;
    type Params = SwitchId;
    type Response = ToggleResponse;
}

/// Params of `Switch.Set`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SetParams {
    /// Switch component index.
    pub id: u32,
    /// Desired output state.
    pub on: bool,
    /// Flip back after this many seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toggle_after: Option<f64>,
}

/// `Switch.Set`.
#[derive(Debug)]
pub struct Set;

impl Method for Set {
    const NAME: &'static str = "Switch.Set";
    const VERB: Verb = Verb::Post;
    type Params = SetParams;
    type Response = ToggleResponse;
}

/// Response of `Switch.GetStatus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchStatus {
    /// Switch component index.
    pub id: u32,
    /// What last changed the output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Current output state.
    pub output: bool,
    /// Active power in watts, on metering models.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apower: Option<f64>,
    /// Voltage, on metering models.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,
    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `Switch.GetStatus`.
#[derive(Debug)]
pub struct GetStatus;

impl Method for GetStatus {
    const NAME: &'static str = "Switch.GetStatus";
    const VERB: Verb = Verb::Get;
    type Params = SwitchId;
    type Response = SwitchStatus;
}

/// Response of `Switch.GetConfig`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchConfig {
    /// Switch component index.
    pub id: u32,
    /// Component name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Output state after power-on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_state: Option<String>,
    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `Switch.GetConfig`.
#[derive(Debug)]
pub struct GetConfig;

impl Method for GetConfig {
    const NAME: &'static str = "Switch.GetConfig";
    const VERB: Verb = Verb::Get;
    type Params = SwitchId;
    type Response = SwitchConfig;
}

/// Params of `Switch.SetConfig`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetConfigParams {
    /// Switch component index.
    pub id: u32,
    /// Partial configuration.
    pub config: Map<String, Value>,
}

/// `Switch.SetConfig`.
#[derive(Debug)]
pub struct SetConfig;

impl Method for SetConfig {
    const NAME: &'static str = "Switch.SetConfig";
    const VERB: Verb = Verb::Post;
    type Params = SetConfigParams;
    type Response = SetConfigResponse;
}

pub(crate) fn register(builder: &mut MethodRegistryBuilder) -> Result<()> {
    builder.register_method::<Toggle>()?;
    builder.register_method::<Set>()?;
    builder.register_method::<GetStatus>()?;
    builder.register_method::<GetConfig>()?;
    builder.register_method::<SetConfig>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_params_omit_toggle_after() {
        let params = SetParams {
            id: 1,
            on: true,
            toggle_after: None,
        };
        assert_eq!(
            serde_json::to_value(params).unwrap(),
            serde_json::json!({"id": 1, "on": true})
        );
    }

    #[test]
    fn status_parses_metering_fields() {
        let status: SwitchStatus = serde_json::from_value(serde_json::json!({
            "id": 0,
            "source": "HTTP_in",
            "output": true,
            "apower": 12.5,
            "temperature": {"tC": 41.2}
        }))
        .unwrap();
        assert!(status.output);
        assert_eq!(status.apower, Some(12.5));
        assert!(status.extra.contains_key("temperature"));
    }
}
