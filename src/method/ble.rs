// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `BLE.*` methods.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::system::SetConfigResponse;
use super::{Method, MethodRegistryBuilder, NoParams, Verb};
use crate::error::Result;

/// `BLE.GetConfig`.
#[derive(Debug)]
pub struct GetConfig;

impl Method for GetConfig {
    const NAME: &'static str = "BLE.GetConfig";
    const VERB: Verb = Verb::Get;
    type Params = NoParams;
    type Response = Map<String, Value>;
}

/// Params of `BLE.SetConfig`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetConfigParams {
    /// Partial BLE configuration, e.g. `{"enable": true}`.
    pub config: Map<String, Value>,
}

/// `BLE.SetConfig`.
#[derive(Debug)]
pub struct SetConfig;

impl Method for SetConfig {
    const NAME: &'static str = "BLE.SetConfig";
    const VERB: Verb = Verb::Post;
    type Params = SetConfigParams;
    type Response = SetConfigResponse;
}

/// `BLE.GetStatus`.
#[derive(Debug)]
pub struct GetStatus;

impl Method for GetStatus {
    const NAME: &'static str = "BLE.GetStatus";
    const VERB: Verb = Verb::Get;
    type Params = NoParams;
    type Response = Map<String, Value>;
}

pub(crate) fn register(builder: &mut MethodRegistryBuilder) -> Result<()> {
    builder.register_method::<GetConfig>()?;
    builder.register_method::<SetConfig>()?;
    builder.register_method::<GetStatus>()
}
