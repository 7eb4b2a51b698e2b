// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `KVS.*` methods: the on-device key/value store.
//!
//! Group settings are mirrored to members through [`Set`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Method, MethodRegistryBuilder, Verb};
use crate::error::Result;

/// Params addressing one key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    /// Key name.
    pub key: String,
}

/// Response of `KVS.Get`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetResponse {
    /// Entry version tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// Stored value.
    pub value: Value,
}

/// `KVS.Get`.
#[derive(Debug)]
pub struct Get;

impl Method for Get {
    const NAME: &'static str = "KVS.Get";
    const VERB: Verb = Verb::Get;
    type Params = Key;
    type Response = GetResponse;
}

/// Params of `KVS.GetMany` and `KVS.List`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchParams {
    /// Key pattern, `*` wildcards allowed.
    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

/// Response of `KVS.GetMany`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetManyResponse {
    /// Matching entries.
    #[serde(default)]
    pub items: BTreeMap<String, GetResponse>,
}

/// `KVS.GetMany`.
#[derive(Debug)]
pub struct GetMany;

impl Method for GetMany {
    const NAME: &'static str = "KVS.GetMany";
    const VERB: Verb = Verb::Get;
    type Params = MatchParams;
    type Response = GetManyResponse;
}

/// One entry of `KVS.List`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntry {
    /// Entry version tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// Response of `KVS.List`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListResponse {
    /// Matching keys.
    #[serde(default)]
    pub keys: BTreeMap<String, ListEntry>,
    /// Store revision.
    #[serde(default)]
    pub rev: u64,
}

/// `KVS.List`.
#[derive(Debug)]
pub struct List;

impl Method for List {
    const NAME: &'static str = "KVS.List";
    const VERB: Verb = Verb::Get;
    type Params = MatchParams;
    type Response = ListResponse;
}

/// Params of `KVS.Set`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetParams {
    /// Key name.
    pub key: String,
    /// Value to store.
    pub value: Value,
}

/// Response of `KVS.Set` and `KVS.Delete`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    /// New entry version tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// New store revision.
    #[serde(default)]
    pub rev: u64,
}

/// `KVS.Set`.
#[derive(Debug)]
pub struct Set;

impl Method for Set {
    const NAME: &'static str = "KVS.Set";
    const VERB: Verb = Verb::Post;
    type Params = SetParams;
    type Response = Revision;
}

/// `KVS.Delete`.
#[derive(Debug)]
pub struct Delete;

impl Method for Delete {
    const NAME: &'static str = "KVS.Delete";
    const VERB: Verb = Verb::Post;
    type Params = Key;
    type Response = Revision;
}

pub(crate) fn register(builder: &mut MethodRegistryBuilder) -> Result<()> {
    builder.register_method::<Get>()?;
    builder.register_method::<GetMany>()?;
    builder.register_method::<List>()?;
    builder.register_method::<Set>()?;
    builder.register_method::<Delete>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_params_rename() {
        let params = MatchParams {
            pattern: Some("group/*".to_string()),
        };
        assert_eq!(
            serde_json::to_value(params).unwrap(),
            serde_json::json!({"match": "group/*"})
        );
        assert_eq!(
            serde_json::to_value(MatchParams::default()).unwrap(),
            serde_json::json!({})
        );
    }

    #[test]
    fn list_response_parses() {
        let list: ListResponse = serde_json::from_value(serde_json::json!({
            "keys": {"room": {"etag": "abc"}},
            "rev": 7
        }))
        .unwrap();
        assert_eq!(list.rev, 7);
        assert!(list.keys.contains_key("room"));
    }
}
