// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `Script.*` methods.
//!
//! Script bodies are uploaded in chunks with [`PutCode`]; the first chunk
//! must have `append = false`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Method, MethodRegistryBuilder, NoParams, Verb};
use crate::error::Result;

/// Params addressing one script slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptId {
    /// Script slot id.
    pub id: u32,
}

/// One entry of `Script.List`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptEntry {
    /// Script slot id.
    pub id: u32,
    /// Script name.
    #[serde(default)]
    pub name: String,
    /// Whether the script runs at boot.
    #[serde(default)]
    pub enable: bool,
    /// Whether the script is running now.
    #[serde(default)]
    pub running: bool,
}

/// Response of `Script.List`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListResponse {
    /// Script slots.
    #[serde(default)]
    pub scripts: Vec<ScriptEntry>,
}

/// `Script.List`.
#[derive(Debug)]
pub struct List;

impl Method for List {
    const NAME: &'static str = "Script.List";
    const VERB: Verb = Verb::Get;
    type Params = NoParams;
    type Response = ListResponse;
}

/// Params of `Script.Create`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateParams {
    /// Script name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// `Script.Create`.
#[derive(Debug)]
pub struct Create;

impl Method for Create {
    const NAME: &'static str = "Script.Create";
    const VERB: Verb = Verb::Post;
    type Params = CreateParams;
    type Response = ScriptId;
}

/// Params of `Script.PutCode`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutCodeParams {
    /// Script slot id.
    pub id: u32,
    /// Code chunk.
    pub code: String,
    /// Append to the existing body instead of replacing it.
    #[serde(default)]
    pub append: bool,
}

/// Response of `Script.PutCode`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutCodeResponse {
    /// Total body length after the write.
    pub len: u64,
}

/// `Script.PutCode`.
#[derive(Debug)]
pub struct PutCode;

impl Method for PutCode {
    const NAME: &'static str = "Script.PutCode";
    const VERB: Verb = Verb::Post;
    type Params = PutCodeParams;
    type Response = PutCodeResponse;
}

/// Response of `Script.Start` and `Script.Stop`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    /// Whether the script was running before the call.
    pub was_running: bool,
}

/// `Script.Start`.
#[derive(Debug)]
pub struct Start;

impl Method for Start {
    const NAME: &'static str = "Script.Start";
    const VERB: Verb = Verb::Post;
    type Params = ScriptId;
    type Response = RunState;
}

/// `Script.Stop`.
#[derive(Debug)]
pub struct Stop;

impl Method for Stop {
    const NAME: &'static str = "Script.Stop";
    const VERB: Verb = Verb::Post;
    type Params = ScriptId;
    type Response = RunState;
}

/// `Script.Delete`.
#[derive(Debug)]
pub struct Delete;

impl Method for Delete {
    const NAME: &'static str = "Script.Delete";
    const VERB: Verb = Verb::Post;
    type Params = ScriptId;
    type Response = Option<Value>;
}

/// Response of `Script.GetStatus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptStatus {
    /// Script slot id.
    pub id: u32,
    /// Whether the script is running.
    #[serde(default)]
    pub running: bool,
    /// Runtime errors, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `Script.GetStatus`.
#[derive(Debug)]
pub struct GetStatus;

impl Method for GetStatus {
    const NAME: &'static str = "Script.GetStatus";
    const VERB: Verb = Verb::Get;
    type Params = ScriptId;
    type Response = ScriptStatus;
}

pub(crate) fn register(builder: &mut MethodRegistryBuilder) -> Result<()> {
    builder.register_method::<List>()?;
    builder.register_method::<Create>()?;
    builder.register_method::<PutCode>()?;
    builder.register_method::<Start>()?;
    builder.register_method::<Stop>()?;
    builder.register_method::<Delete>()?;
    builder.register_method::<GetStatus>()
}
