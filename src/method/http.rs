// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `HTTP.*` methods: outbound requests performed by the device itself.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Method, MethodRegistryBuilder, Verb};
use crate::error::Result;

/// Params of `HTTP.GET`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetParams {
    /// URL to fetch.
    pub url: String,
    /// Request timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u32>,
}

/// Params of `HTTP.POST`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostParams {
    /// URL to post to.
    pub url: String,
    /// Request body.
    pub body: String,
    /// `Content-Type` header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Request timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u32>,
}

/// Response of `HTTP.GET` and `HTTP.POST`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    /// Status code the device received.
    pub code: u16,
    /// Status text.
    #[serde(default)]
    pub message: String,
    /// Response headers.
    #[serde(default)]
    pub headers: Map<String, Value>,
    /// Response body, if text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Response body, if binary, base64-encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_b64: Option<String>,
}

/// `HTTP.GET`.
///
/// The device performs a request on the caller's behalf, so this is sent
/// as a POST even though it is a fetch.
#[derive(Debug)]
pub struct HttpGet;

impl Method for HttpGet {
    const NAME: &'static str = "HTTP.GET";
    const VERB: Verb = Verb::Post;
    type Params = GetParams;
    type Response = HttpResponse;
}

/// `HTTP.POST`.
#[derive(Debug)]
pub struct HttpPost;

impl Method for HttpPost {
    const NAME: &'static str = "HTTP.POST";
    const VERB: Verb = Verb::Post;
    type Params = PostParams;
    type Response = HttpResponse;
}

pub(crate) fn register(builder: &mut MethodRegistryBuilder) -> Result<()> {
    builder.register_method::<HttpGet>()?;
    builder.register_method::<HttpPost>()
}
