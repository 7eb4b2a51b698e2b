// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shelly Gen2 RPC method definitions and the method registry.
//!
//! Every RPC a device understands is described by a type implementing
//! [`Method`]: its dotted name, whether it is side-effect free (and may go
//! out as an HTTP `GET`), and its typed params and response.
//!
//! At startup the component modules register a [`Descriptor`] per method
//! into a [`MethodRegistryBuilder`], which is then sealed into an immutable
//! [`MethodRegistry`]. Lookups on the sealed registry need no lock.
//!
//! # Available Components
//!
//! | Module | Methods |
//! |--------|---------|
//! | [`system`] | `Shelly.GetDeviceInfo`, `Shelly.GetComponents`, `Sys.GetConfig`, ... |
//! | [`switch`] | `Switch.Toggle`, `Switch.Set`, `Switch.GetStatus`, ... |
//! | [`kvs`] | `KVS.Get`, `KVS.Set`, `KVS.List`, ... |
//! | [`schedule`] | `Schedule.List`, `Schedule.Create`, ... |
//! | [`script`] | `Script.List`, `Script.PutCode`, `Script.Start`, ... |
//! | [`ble`] | `BLE.GetConfig`, `BLE.SetConfig`, `BLE.GetStatus` |
//! | [`mqtt`] | `Mqtt.GetConfig`, `Mqtt.SetConfig`, `Mqtt.GetStatus` |
//! | [`http`] | `HTTP.GET`, `HTTP.POST` |
//! | [`wifi`] | `WiFi.GetConfig`, `WiFi.Scan`, ... |
//!
//! # Examples
//!
//! ```
//! use myhome::method::{Method, MethodRegistry, Verb, switch};
//!
//! let registry = MethodRegistry::standard().unwrap();
//! let toggle = registry.lookup("Switch.Toggle").unwrap();
//! assert_eq!(toggle.verb(), Verb::Post);
//! assert_eq!(switch::Toggle::NAME, "Switch.Toggle");
//!
//! assert!(registry.lookup("Switch.Explode").is_err());
//! ```

pub mod ble;
pub mod http;
pub mod kvs;
pub mod mqtt;
pub mod schedule;
pub mod script;
pub mod switch;
pub mod system;
pub mod wifi;

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Transport hint for a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verb {
    /// No side effects; may be sent as an HTTP `GET` with query parameters.
    Get,
    /// Sent as an HTTP `POST` with a JSON body.
    Post,
}

/// A Shelly RPC method with statically known params and response types.
pub trait Method {
    /// Dotted method name, e.g. `Switch.Toggle`.
    const NAME: &'static str;

    /// Transport hint.
    const VERB: Verb;

    /// Request parameters.
    type Params: Serialize + Send + Sync;

    /// Response body.
    type Response: DeserializeOwned + Serialize + Send + 'static;
}

/// Params for methods that take none. Serializes as `{}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoParams {}

/// A freshly allocated, not yet filled, response container.
///
/// Each call to [`Descriptor::allocate`] returns a new one; containers are
/// never shared between calls.
pub trait ResultSlot: Send {
    /// Decodes `value` into the container.
    ///
    /// # Errors
    ///
    /// Returns the serde error if `value` does not match the response type.
    fn fill(&mut self, value: Value) -> std::result::Result<(), serde_json::Error>;

    /// Returns whether [`fill`](Self::fill) succeeded at least once.
    fn is_filled(&self) -> bool;

    /// Re-encodes the decoded response as JSON (`null` if unfilled).
    fn to_value(&self) -> Value;

    /// Converts the container into `Box<Option<T>>` for downcasting.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

struct Slot<T>(Option<T>);

impl<T> ResultSlot for Slot<T>
where
    T: DeserializeOwned + Serialize + Send + 'static,
{
    fn fill(&mut self, value: Value) -> std::result::Result<(), serde_json::Error> {
        self.0 = Some(serde_json::from_value(value)?);
        Ok(())
    }

    fn is_filled(&self) -> bool {
        self.0.is_some()
    }

    fn to_value(&self) -> Value {
        self.0
            .as_ref()
            .and_then(|v| serde_json::to_value(v).ok())
            .unwrap_or(Value::Null)
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        Box::new(self.0)
    }
}

fn allocate_slot<T>() -> Box<dyn ResultSlot>
where
    T: DeserializeOwned + Serialize + Send + 'static,
{
    Box::new(Slot::<T>(None))
}

/// Registry entry for one method.
#[derive(Clone, Copy)]
pub struct Descriptor {
    name: &'static str,
    verb: Verb,
    alloc: fn() -> Box<dyn ResultSlot>,
    response_type: TypeId,
    response_type_name: &'static str,
}

impl Descriptor {
    /// Builds the descriptor of a typed method.
    #[must_use]
    pub fn of<M: Method>() -> Self {
        Self {
            name: M::NAME,
            verb: M::VERB,
            alloc: allocate_slot::<M::Response>,
            response_type: TypeId::of::<M::Response>(),
            response_type_name: std::any::type_name::<M::Response>(),
        }
    }

    /// Returns the dotted method name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the transport hint.
    #[must_use]
    pub fn verb(&self) -> Verb {
        self.verb
    }

    /// Allocates a fresh, empty response container.
    #[must_use]
    pub fn allocate(&self) -> Box<dyn ResultSlot> {
        (self.alloc)()
    }

    /// Allocates a container and decodes `value` into it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] when the device's answer does not match
    /// the response type.
    pub fn decode(&self, value: Value) -> Result<Box<dyn ResultSlot>> {
        let mut slot = self.allocate();
        slot.fill(value)
            .map_err(|e| Error::Internal(format!("malformed {} response: {e}", self.name)))?;
        Ok(slot)
    }

    /// Returns whether this descriptor's response type is `T`.
    #[must_use]
    pub fn responds_with<T: 'static>(&self) -> bool {
        self.response_type == TypeId::of::<T>()
    }

    fn same_as(&self, other: &Self) -> bool {
        self.name == other.name
            && self.verb == other.verb
            && self.response_type == other.response_type
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("name", &self.name)
            .field("verb", &self.verb)
            .field("response", &self.response_type_name)
            .finish()
    }
}

/// Collects descriptors before dispatch begins.
#[derive(Debug, Default)]
pub struct MethodRegistryBuilder {
    table: HashMap<&'static str, Descriptor>,
}

impl MethodRegistryBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a descriptor.
    ///
    /// Registering the same descriptor twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a different descriptor is already
    /// registered under the same name.
    pub fn register(&mut self, descriptor: Descriptor) -> Result<()> {
        if let Some(existing) = self.table.get(descriptor.name) {
            if existing.same_as(&descriptor) {
                return Ok(());
            }
            return Err(Error::Config(format!(
                "method {} registered twice with different descriptors ({existing:?} vs {descriptor:?})",
                descriptor.name
            )));
        }
        tracing::trace!(method = descriptor.name, "Registering method");
        self.table.insert(descriptor.name, descriptor);
        Ok(())
    }

    /// Registers the descriptor of a typed method.
    ///
    /// # Errors
    ///
    /// See [`register`](Self::register).
    pub fn register_method<M: Method>(&mut self) -> Result<()> {
        self.register(Descriptor::of::<M>())
    }

    /// Seals the builder. No registration is possible afterwards.
    #[must_use]
    pub fn seal(self) -> MethodRegistry {
        tracing::debug!(methods = self.table.len(), "Method registry sealed");
        MethodRegistry { table: self.table }
    }
}

/// Sealed, read-only table of method descriptors.
#[derive(Debug)]
pub struct MethodRegistry {
    table: HashMap<&'static str, Descriptor>,
}

impl MethodRegistry {
    /// Builds a registry holding every component this crate knows about.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if two components disagree on a method.
    pub fn standard() -> Result<Self> {
        let mut builder = MethodRegistryBuilder::new();
        system::register(&mut builder)?;
        switch::register(&mut builder)?;
        kvs::register(&mut builder)?;
        schedule::register(&mut builder)?;
        script::register(&mut builder)?;
        ble::register(&mut builder)?;
        mqtt::register(&mut builder)?;
        http::register(&mut builder)?;
        wifi::register(&mut builder)?;
        Ok(builder.seal())
    }

    /// Looks up a method by its dotted name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MethodUnknown`] if nothing is registered under `name`.
    pub fn lookup(&self, name: &str) -> Result<&Descriptor> {
        self.table
            .get(name)
            .ok_or_else(|| Error::MethodUnknown(name.to_string()))
    }

    /// Returns the number of registered methods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Returns all registered method names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.table.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ConflictingToggle;

    impl Method for ConflictingToggle {
        const NAME: &'static str = "Switch.Toggle";
        const VERB: Verb = Verb::Get;
        type Params = NoParams;
        type Response = Value;
    }

    #[test]
    fn register_same_descriptor_is_noop() {
        let mut builder = MethodRegistryBuilder::new();
        builder.register_method::<switch::Toggle>().unwrap();
        builder.register_method::<switch::Toggle>().unwrap();
        assert_eq!(builder.seal().len(), 1);
    }

    #[test]
    fn register_conflicting_descriptor_fails() {
        let mut builder = MethodRegistryBuilder::new();
        builder.register_method::<switch::Toggle>().unwrap();
        let err = builder.register_method::<ConflictingToggle>().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn lookup_unknown_method() {
        let registry = MethodRegistry::standard().unwrap();
        let err = registry.lookup("Cover.Open").err().unwrap();
        assert!(matches!(err, Error::MethodUnknown(name) if name == "Cover.Open"));
    }

    #[test]
    fn standard_registry_covers_all_components() {
        let registry = MethodRegistry::standard().unwrap();
        for name in [
            "Shelly.GetDeviceInfo",
            "Switch.Toggle",
            "KVS.Set",
            "Schedule.List",
            "Script.PutCode",
            "BLE.GetConfig",
            "Mqtt.GetConfig",
            "HTTP.GET",
            "WiFi.Scan",
        ] {
            assert!(registry.lookup(name).is_ok(), "{name} missing");
        }
    }

    #[test]
    fn allocator_returns_fresh_containers() {
        let registry = MethodRegistry::standard().unwrap();
        for name in registry.names() {
            let descriptor = registry.lookup(name).unwrap();
            let a = descriptor.allocate();
            let b = descriptor.allocate();
            assert!(!a.is_filled());
            assert!(!b.is_filled());
            let pa = std::ptr::from_ref::<dyn ResultSlot>(a.as_ref()).cast::<u8>();
            let pb = std::ptr::from_ref::<dyn ResultSlot>(b.as_ref()).cast::<u8>();
            // zero-sized containers may share an address, non-empty ones never do
            if std::mem::size_of_val(a.as_ref()) > 0 {
                assert_ne!(pa, pb, "{name} allocator aliased");
            }
        }
    }

    #[test]
    fn filling_one_container_leaves_the_other_empty() {
        let registry = MethodRegistry::standard().unwrap();
        let descriptor = registry.lookup("Switch.Toggle").unwrap();
        let mut a = descriptor.allocate();
        let b = descriptor.allocate();
        a.fill(serde_json::json!({"was_on": true})).unwrap();
        assert!(a.is_filled());
        assert!(!b.is_filled());
        assert_eq!(a.to_value()["was_on"], true);
    }

    #[test]
    fn decode_rejects_mismatched_body() {
        let registry = MethodRegistry::standard().unwrap();
        let descriptor = registry.lookup("Switch.Toggle").unwrap();
        let err = descriptor.decode(serde_json::json!("nope")).err().unwrap();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn decoded_slot_downcasts_to_response_type() {
        let descriptor = Descriptor::of::<switch::Toggle>();
        assert!(descriptor.responds_with::<switch::ToggleResponse>());
        let slot = descriptor
            .decode(serde_json::json!({"was_on": false}))
            .unwrap();
        let response = slot
            .into_any()
            .downcast::<Option<switch::ToggleResponse>>()
            .unwrap();
        assert!(!response.unwrap().was_on);
    }
}
