// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `Schedule.*` methods.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Method, MethodRegistryBuilder, NoParams, Verb};
use crate::error::Result;

/// A call a schedule job performs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCall {
    /// Method to invoke.
    pub method: String,
    /// Params of the call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A schedule job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job id, assigned by the device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    /// Whether the job is active.
    #[serde(default)]
    pub enable: bool,
    /// Cron-like timespec, e.g. `0 0 7 * * MON-FRI`.
    pub timespec: String,
    /// Calls to make when the job fires.
    #[serde(default)]
    pub calls: Vec<JobCall>,
}

/// Response of `Schedule.List`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListResponse {
    /// Configured jobs.
    #[serde(default)]
    pub jobs: Vec<Job>,
    /// Schedule revision.
    #[serde(default)]
    pub rev: u64,
}

/// `Schedule.List`.
#[derive(Debug)]
pub struct List;

impl Method for List {
    const NAME: &'static str = "Schedule.List";
    const VERB: Verb = Verb::Get;
    type Params = NoParams;
    type Response = ListResponse;
}

/// Response of the mutating `Schedule.*` methods.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    /// Id of the created job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    /// New schedule revision.
    #[serde(default)]
    pub rev: u64,
}

/// `Schedule.Create`.
#[derive(Debug)]
pub struct Create;

impl Method for Create {
    const NAME: &'static str = "Schedule.Create";
    const VERB: Verb = Verb::Post;
    type Params = Job;
    type Response = Revision;
}

/// `Schedule.Update`. `id` must be set.
#[derive(Debug)]
pub struct Update;

impl Method for Update {
    const NAME: &'static str = "Schedule.Update";
    const VERB: Verb = Verb::Post;
    type Params = Job;
    type Response = Revision;
}

/// Params of `Schedule.Delete`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobId {
    /// Job id.
    pub id: u32,
}

/// `Schedule.Delete`.
#[derive(Debug)]
pub struct Delete;

impl Method for Delete {
    const NAME: &'static str = "Schedule.Delete";
    const VERB: Verb = Verb::Post;
    type Params = JobId;
    type Response = Revision;
}

/// `Schedule.DeleteAll`.
#[derive(Debug)]
pub struct DeleteAll;

impl Method for DeleteAll {
    const NAME: &'static str = "Schedule.DeleteAll";
    const VERB: Verb = Verb::Post;
    type Params = NoParams;
    type Response = Revision;
}

pub(crate) fn register(builder: &mut MethodRegistryBuilder) -> Result<()> {
    builder.register_method::<List>()?;
    builder.register_method::<Create>()?;
    builder.register_method::<Update>()?;
    builder.register_method::<Delete>()?;
    builder.register_method::<DeleteAll>()
}
