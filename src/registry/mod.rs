// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Canonical set of known devices.
//!
//! The [`Registry`] keeps every [`Device`] in memory, backed by the
//! SQLite [`store`](crate::store). Identifiers resolve by id, name, host
//! or MAC; globs (`shellyblu*`, `*`) select many devices at once and
//! [`Registry::foreach`] fans a call out to all of them.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use myhome::{Channel, Context, Registry};
//! use myhome::method::switch;
//!
//! # async fn example(registry: Arc<Registry>) -> myhome::Result<()> {
//! let ctx = Context::new();
//! let results = registry
//!     .foreach(&ctx, "kitchen-*", |ctx, device| async move {
//!         device
//!             .call::<switch::Toggle>(&ctx, Channel::Default, &switch::SwitchId { id: 0 })
//!             .await
//!     })
//!     .await?;
//! for (id, result) in results {
//!     println!("{id}: {:?}", result.map(|r| r.was_on));
//! }
//! # Ok(())
//! # }
//! ```

mod pattern;

pub use pattern::{Glob, is_glob};

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;

use crate::context::Context;
use crate::device::{Device, DeviceRecord, Dispatcher, normalize_mac};
use crate::discovery::{DeviceCandidate, ServiceKind};
use crate::error::{Error, Result};
use crate::store::{DbPool, DeviceRepo, Group, GroupRepo, TemperatureRoomRepo};

/// Cancels its context when dropped.
struct CancelOnDrop(Context);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// In-memory device table backed by the store.
#[derive(Debug)]
pub struct Registry {
    devices: RwLock<HashMap<String, Arc<Device>>>,
    store: DeviceRepo,
    groups: GroupRepo,
    rooms: TemperatureRoomRepo,
    dispatcher: Arc<Dispatcher>,
}

impl Registry {
    /// Creates an empty registry. Call [`load`](Self::load) to read the
    /// store.
    #[must_use]
    pub fn new(pool: DbPool, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            store: DeviceRepo::new(pool.clone()),
            groups: GroupRepo::new(pool.clone()),
            rooms: TemperatureRoomRepo::new(pool),
            dispatcher,
        }
    }

    /// Loads every stored device, replacing the in-memory table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the store cannot be read.
    pub fn load(&self) -> Result<usize> {
        let records = self.store.list()?;
        let mut devices = HashMap::with_capacity(records.len());
        for record in records {
            let device = self.wrap(record);
            devices.insert(device.id(), device);
        }
        let count = devices.len();
        *self.devices.write() = devices;
        tracing::info!(devices = count, "Registry loaded");
        Ok(count)
    }

    fn wrap(&self, record: DeviceRecord) -> Arc<Device> {
        let device = Arc::new(Device::new(record));
        device.attach(&self.dispatcher);
        device
    }

    /// Returns the dispatcher shared by all devices.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Returns the temperature room repository.
    #[must_use]
    pub fn rooms(&self) -> &TemperatureRoomRepo {
        &self.rooms
    }

    /// Returns the number of known devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    /// Returns whether no device is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    fn ensure_name_free(&self, id: &str, name: &str) -> Result<()> {
        if name.is_empty() {
            return Ok(());
        }
        let taken = self
            .devices
            .read()
            .values()
            .any(|d| d.name() == name && d.id() != id);
        if taken {
            return Err(Error::BadRequest(format!("device name {name:?} is already taken")));
        }
        Ok(())
    }

    /// Inserts a device or merges it into the known one with the same id.
    ///
    /// Mutable fields are last-writer-wins; an existing name, room and
    /// group membership are preserved. Empty host, MAC or capabilities
    /// never overwrite known values.
    ///
    /// # Errors
    ///
    /// - [`Error::BadRequest`] for an empty id or a name used by another device
    /// - [`Error::Storage`] if the store write fails
    pub fn upsert(&self, record: DeviceRecord) -> Result<Arc<Device>> {
        if record.id.is_empty() {
            return Err(Error::BadRequest("device id is empty".to_string()));
        }
        let existing = self.devices.read().get(&record.id).cloned();

        let Some(device) = existing else {
            self.ensure_name_free(&record.id, &record.name)?;
            let mut record = record;
            record.groups = self.groups.groups_of(&record.id)?;
            self.store.upsert(&record)?;
            tracing::info!(device = %record.id, host = %record.host, "Device added");
            let device = self.wrap(record);
            self.devices.write().insert(device.id(), Arc::clone(&device));
            return Ok(device);
        };

        let mut merged = device.record();
        if merged.name.is_empty() {
            self.ensure_name_free(&record.id, &record.name)?;
            merged.name.clone_from(&record.name);
        }
        if merged.room_id.is_none() {
            merged.room_id.clone_from(&record.room_id);
        }
        merge_mutable(&mut merged, record);
        self.store.upsert(&merged)?;
        self.apply(&device, merged);
        Ok(device)
    }

    /// Replaces a known device's record, including name and room.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the id is unknown
    /// - [`Error::BadRequest`] if the name is used by another device
    pub fn update(&self, record: DeviceRecord) -> Result<Arc<Device>> {
        let device = self
            .devices
            .read()
            .get(&record.id)
            .cloned()
            .ok_or_else(|| Error::NotFound(record.id.clone()))?;
        self.ensure_name_free(&record.id, &record.name)?;

        let mut merged = device.record();
        merged.name.clone_from(&record.name);
        merged.room_id.clone_from(&record.room_id);
        merge_mutable(&mut merged, record);
        self.store.upsert(&merged)?;
        self.apply(&device, merged);
        Ok(device)
    }

    fn apply(&self, device: &Device, record: DeviceRecord) {
        let host_changed = device.host() != record.host;
        let host = record.host.clone();
        device.update(|current| *current = record);
        if host_changed {
            device.set_host(host);
        }
    }

    /// Writes the device's current record to the store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the write fails.
    pub fn persist(&self, device: &Device) -> Result<()> {
        self.store.upsert(&device.record())
    }

    /// Resolves one identifier: id, then name, then host, then MAC.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if nothing matches.
    pub fn get(&self, identifier: &str) -> Result<Arc<Device>> {
        let devices = self.devices.read();
        if let Some(device) = devices.get(identifier) {
            return Ok(Arc::clone(device));
        }
        let mac = normalize_mac(identifier);
        let by = |pred: &dyn Fn(&DeviceRecord) -> bool| {
            devices.values().find(|d| pred(&d.record())).cloned()
        };
        by(&|r| !r.name.is_empty() && r.name == identifier)
            .or_else(|| by(&|r| !r.host.is_empty() && r.host == identifier))
            .or_else(|| by(&|r| !r.mac.is_empty() && r.normalized_mac() == mac))
            .ok_or_else(|| Error::NotFound(identifier.to_string()))
    }

    /// Returns the devices matching a glob, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadRequest`] for a malformed pattern.
    pub fn match_pattern(&self, pattern: &str) -> Result<Vec<Arc<Device>>> {
        let glob = Glob::new(pattern)?;
        let mut matched: Vec<_> = self
            .devices
            .read()
            .values()
            .filter(|d| glob.matches(&d.record()))
            .cloned()
            .collect();
        matched.sort_by_key(|d| d.id());
        Ok(matched)
    }

    /// Resolves a glob to its matches or a plain identifier to one device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if nothing matches.
    pub fn resolve(&self, identifier: &str) -> Result<Vec<Arc<Device>>> {
        if is_glob(identifier) {
            let matched = self.match_pattern(identifier)?;
            if matched.is_empty() {
                return Err(Error::NotFound(identifier.to_string()));
            }
            Ok(matched)
        } else {
            self.get(identifier).map(|d| vec![d])
        }
    }

    /// Runs `f` on every device `pattern` resolves to, one task each, and
    /// waits for all of them.
    ///
    /// Each task gets a child of `ctx`; cancelling `ctx` (or dropping the
    /// returned future) cancels them all. Per-device failures are kept in
    /// the result map and never stop the others.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the pattern matches no device.
    pub async fn foreach<T, F, Fut>(
        &self,
        ctx: &Context,
        pattern: &str,
        f: F,
    ) -> Result<BTreeMap<String, Result<T>>>
    where
        F: Fn(Context, Arc<Device>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let devices = self.resolve(pattern)?;
        self.foreach_devices(ctx, devices, f).await
    }

    /// Like [`foreach`](Self::foreach) over an explicit device list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if `devices` is empty.
    pub async fn foreach_devices<T, F, Fut>(
        &self,
        ctx: &Context,
        devices: Vec<Arc<Device>>,
        f: F,
    ) -> Result<BTreeMap<String, Result<T>>>
    where
        F: Fn(Context, Arc<Device>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if devices.is_empty() {
            return Err(Error::NotFound("no device selected".to_string()));
        }
        let scope = CancelOnDrop(ctx.child());

        let handles: Vec<_> = devices
            .into_iter()
            .map(|device| {
                let id = device.id();
                let task = f(scope.0.child(), device);
                (id, tokio::spawn(task))
            })
            .collect();
        tracing::debug!(devices = handles.len(), "Fan-out started");

        let (ids, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        let outcomes = futures::future::join_all(handles).await;

        Ok(ids
            .into_iter()
            .zip(outcomes)
            .map(|(id, outcome)| {
                let result = outcome.unwrap_or_else(|e| {
                    Err(Error::Internal(format!("task for {id} failed: {e}")))
                });
                (id, result)
            })
            .collect())
    }

    /// Removes a device from memory and the store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the identifier is unknown.
    pub fn forget(&self, identifier: &str) -> Result<DeviceRecord> {
        let device = self.get(identifier)?;
        let id = device.id();
        self.store.delete(&id)?;
        self.devices.write().remove(&id);
        self.dispatcher.limiter().forget(&id);
        tracing::info!(device = %id, "Device forgotten");
        Ok(device.record())
    }

    /// Applies a discovery candidate: refreshes host and last-seen of a
    /// known device or adds a new one. Broker announcements are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the store write fails.
    pub fn observe(&self, candidate: &DeviceCandidate) -> Result<Option<Arc<Device>>> {
        if candidate.kind != ServiceKind::Shelly {
            return Ok(None);
        }
        let mut record = DeviceRecord::new(&candidate.id)
            .with_model(&candidate.model)
            .with_host(candidate.host.to_string())
            .with_mac(&candidate.serial);
        record.generation = candidate.generation.unwrap_or_default();
        record.last_seen = Some(candidate.seen_at);
        tracing::debug!(device = %candidate.id, host = %candidate.host, "Device observed");
        self.upsert(record).map(Some)
    }

    /// Upserts a batch of records and returns their ids.
    ///
    /// # Errors
    ///
    /// Stops at the first record that fails.
    pub fn import(&self, records: Vec<DeviceRecord>) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(records.len());
        for mut record in records {
            if record.last_seen.is_none() {
                record.last_seen = Some(Utc::now());
            }
            ids.push(self.upsert(record)?.id());
        }
        tracing::info!(devices = ids.len(), "Devices imported");
        Ok(ids)
    }

    /// Places a device in a room, or removes it from its room with `None`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the identifier is unknown.
    pub fn set_room(&self, identifier: &str, room_id: Option<String>) -> Result<DeviceRecord> {
        let device = self.get(identifier)?;
        device.update(|record| record.room_id = room_id);
        self.persist(&device)?;
        Ok(device.record())
    }

    /// Returns the devices placed in `room_id`, ordered by id.
    #[must_use]
    pub fn devices_in_room(&self, room_id: &str) -> Vec<DeviceRecord> {
        let mut records: Vec<_> = self
            .devices
            .read()
            .values()
            .map(|d| d.record())
            .filter(|r| r.room_id.as_deref() == Some(room_id))
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Returns every room id referenced by a device, sorted.
    #[must_use]
    pub fn room_ids(&self) -> Vec<String> {
        let mut rooms: Vec<_> = self
            .devices
            .read()
            .values()
            .filter_map(|d| d.record().room_id)
            .collect();
        rooms.sort();
        rooms.dedup();
        rooms
    }

    /// Re-fetches a device's identity and persists it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown identifier, or the
    /// device call's error.
    pub async fn refresh(&self, ctx: &Context, identifier: &str) -> Result<DeviceRecord> {
        let device = self.get(identifier)?;
        let record = device.refresh(ctx).await?;
        self.persist(&device)?;
        Ok(record)
    }

    /// Creates a group. Members must be known devices.
    ///
    /// # Errors
    ///
    /// - [`Error::BadRequest`] if the name is empty or taken
    /// - [`Error::NotFound`] for an unknown member
    pub fn create_group(&self, mut group: Group) -> Result<Group> {
        if group.name.is_empty() {
            return Err(Error::BadRequest("group name is empty".to_string()));
        }
        let members = group
            .members
            .iter()
            .map(|m| self.get(m))
            .collect::<Result<Vec<_>>>()?;
        group.members = members.iter().map(|d| d.id()).collect();

        if !self.groups.create(&group)? {
            return Err(Error::BadRequest(format!("group {} already exists", group.name)));
        }
        for device in &members {
            device.update(|r| r.groups.insert(group.name.clone()));
        }
        tracing::info!(group = %group.name, members = group.members.len(), "Group created");
        Ok(group)
    }

    /// Deletes a group.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the group does not exist.
    pub fn delete_group(&self, name: &str) -> Result<()> {
        let group = self.group(name)?;
        self.groups.delete(name)?;
        for id in &group.members {
            if let Some(device) = self.devices.read().get(id) {
                device.update(|r| r.groups.remove(name));
            }
        }
        Ok(())
    }

    /// Returns a group.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the group does not exist.
    pub fn group(&self, name: &str) -> Result<Group> {
        self.groups
            .get(name)?
            .ok_or_else(|| Error::NotFound(format!("group {name}")))
    }

    /// Returns the known member devices of a group, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the group does not exist.
    pub fn group_devices(&self, name: &str) -> Result<Vec<Arc<Device>>> {
        let group = self.group(name)?;
        let devices = self.devices.read();
        Ok(group
            .members
            .iter()
            .filter_map(|id| devices.get(id).cloned())
            .collect())
    }

    /// Lists all groups.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the store cannot be read.
    pub fn groups(&self) -> Result<Vec<Group>> {
        self.groups.list()
    }

    /// Adds a device to a group; returns `false` if it already was a member.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown group or device.
    pub fn add_to_group(&self, name: &str, identifier: &str) -> Result<bool> {
        let device = self.get(identifier)?;
        let added = self.groups.add_member(name, &device.id())?;
        device.update(|r| r.groups.insert(name.to_string()));
        Ok(added)
    }

    /// Removes a device from a group; returns `false` if it was not a member.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown group or device.
    pub fn remove_from_group(&self, name: &str, identifier: &str) -> Result<bool> {
        self.group(name)?;
        let device = self.get(identifier)?;
        let removed = self.groups.remove_member(name, &device.id())?;
        device.update(|r| r.groups.remove(name));
        Ok(removed)
    }
}

fn merge_mutable(current: &mut DeviceRecord, incoming: DeviceRecord) {
    if !incoming.manufacturer.is_empty() {
        current.manufacturer = incoming.manufacturer;
    }
    if !incoming.model.is_empty() {
        current.model = incoming.model;
    }
    if incoming.generation > 0 {
        current.generation = incoming.generation;
    }
    if !incoming.host.is_empty() {
        current.host = incoming.host;
    }
    if !incoming.mac.is_empty() {
        current.mac = incoming.mac;
    }
    if incoming.last_seen.is_some() {
        current.last_seen = incoming.last_seen;
    }
    if !incoming.capabilities.is_empty() {
        current.capabilities = incoming.capabilities;
    }
    if incoming.info.is_some() {
        current.info = incoming.info;
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use super::*;
    use crate::method::MethodRegistry;
    use crate::protocol::{HttpChannel, HttpConfig, RateLimiter};
    use crate::store::init_memory;

    fn registry() -> Registry {
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(MethodRegistry::standard().unwrap()),
            HttpChannel::new(&HttpConfig::new()).unwrap(),
            None,
            RateLimiter::new(Duration::ZERO),
        ));
        Registry::new(init_memory().unwrap(), dispatcher)
    }

    fn candidate(id: &str, host: [u8; 4]) -> DeviceCandidate {
        DeviceCandidate {
            kind: ServiceKind::Shelly,
            id: id.to_string(),
            model: "shellyplus1".to_string(),
            serial: "a8032ab12345".to_string(),
            host: Ipv4Addr::from(host),
            port: 80,
            generation: Some(2),
            app: Some("Plus1".to_string()),
            version: None,
            seen_at: Utc::now(),
        }
    }

    #[test]
    fn upsert_preserves_name_and_room() {
        let registry = registry();
        registry
            .upsert(DeviceRecord::new("d1").with_name("porch").with_room("garden"))
            .unwrap();
        registry
            .upsert(DeviceRecord::new("d1").with_name("other").with_host("192.0.2.10"))
            .unwrap();

        let record = registry.get("d1").unwrap().record();
        assert_eq!(record.name, "porch");
        assert_eq!(record.room_id.as_deref(), Some("garden"));
        assert_eq!(record.host, "192.0.2.10");
    }

    #[test]
    fn upsert_fills_missing_name_and_room() {
        let registry = registry();
        registry.upsert(DeviceRecord::new("d1").with_host("192.0.2.10")).unwrap();
        registry
            .upsert(DeviceRecord::new("d1").with_name("porch").with_room("garden"))
            .unwrap();

        let record = registry.get("porch").unwrap().record();
        assert_eq!(record.id, "d1");
        assert_eq!(record.room_id.as_deref(), Some("garden"));
        assert_eq!(record.host, "192.0.2.10");
    }

    #[test]
    fn upsert_rejects_duplicate_name() {
        let registry = registry();
        registry.upsert(DeviceRecord::new("d1").with_name("lamp")).unwrap();
        let err = registry
            .upsert(DeviceRecord::new("d2").with_name("lamp"))
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn update_renames() {
        let registry = registry();
        registry.upsert(DeviceRecord::new("d1").with_name("lamp")).unwrap();
        registry.update(DeviceRecord::new("d1").with_name("desk")).unwrap();
        assert_eq!(registry.get("desk").unwrap().id(), "d1");
        assert!(matches!(
            registry.update(DeviceRecord::new("d9")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn get_by_any_identifier() {
        let registry = registry();
        registry
            .upsert(
                DeviceRecord::new("shellyplus1-a8032ab12345")
                    .with_name("porch")
                    .with_host("192.0.2.10")
                    .with_mac("A8:03:2A:B1:23:45"),
            )
            .unwrap();
        for identifier in [
            "shellyplus1-a8032ab12345",
            "porch",
            "192.0.2.10",
            "a8:03:2a:b1:23:45",
            "A8032AB12345",
        ] {
            assert_eq!(registry.get(identifier).unwrap().id(), "shellyplus1-a8032ab12345");
        }
        assert!(matches!(registry.get("garage"), Err(Error::NotFound(_))));
    }

    #[test]
    fn star_matches_all_sorted() {
        let registry = registry();
        for id in ["d3", "d1", "d2"] {
            registry.upsert(DeviceRecord::new(id)).unwrap();
        }
        let ids: Vec<_> = registry
            .match_pattern("*")
            .unwrap()
            .iter()
            .map(|d| d.id())
            .collect();
        assert_eq!(ids, ["d1", "d2", "d3"]);
    }

    #[test]
    fn reload_from_store() {
        let registry = registry();
        registry.upsert(DeviceRecord::new("d1").with_host("192.0.2.10")).unwrap();
        registry.devices.write().clear();
        assert_eq!(registry.load().unwrap(), 1);
        assert!(registry.get("d1").unwrap().http_ready());
    }

    #[test]
    fn observe_updates_host_without_evicting() {
        let registry = registry();
        registry.upsert(DeviceRecord::new("d-gone")).unwrap();
        registry
            .observe(&candidate("shellyplus1-a8032ab12345", [192, 0, 2, 10]))
            .unwrap();
        registry
            .observe(&candidate("shellyplus1-a8032ab12345", [192, 0, 2, 11]))
            .unwrap();

        let device = registry.get("shellyplus1-a8032ab12345").unwrap();
        assert_eq!(device.host(), "192.0.2.11");
        assert_eq!(device.record().generation, 2);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn observe_ignores_brokers() {
        let registry = registry();
        let mut broker = candidate("mosquitto", [192, 0, 2, 1]);
        broker.kind = ServiceKind::Mqtt;
        assert!(registry.observe(&broker).unwrap().is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn forget_removes_from_store() {
        let registry = registry();
        registry.upsert(DeviceRecord::new("d1").with_name("lamp")).unwrap();
        registry.forget("lamp").unwrap();
        assert!(registry.is_empty());
        assert_eq!(registry.load().unwrap(), 0);
        assert!(matches!(registry.forget("lamp"), Err(Error::NotFound(_))));
    }

    #[test]
    fn groups_track_membership() {
        let registry = registry();
        registry.upsert(DeviceRecord::new("d1").with_name("lamp")).unwrap();
        registry.upsert(DeviceRecord::new("d2")).unwrap();

        let mut group = Group::new("living");
        group.members.insert("lamp".to_string());
        let created = registry.create_group(group).unwrap();
        assert!(created.members.contains("d1"));
        assert!(registry.get("d1").unwrap().record().groups.contains("living"));

        assert!(registry.add_to_group("living", "d2").unwrap());
        assert!(!registry.add_to_group("living", "d2").unwrap());
        assert_eq!(registry.group("living").unwrap().members.len(), 2);

        assert!(matches!(
            registry.create_group(Group::new("living")),
            Err(Error::BadRequest(_))
        ));

        registry.delete_group("living").unwrap();
        assert!(registry.get("d1").unwrap().record().groups.is_empty());
        assert!(matches!(registry.group("living"), Err(Error::NotFound(_))));
    }

    #[test]
    fn rooms_from_devices() {
        let registry = registry();
        registry.upsert(DeviceRecord::new("d1").with_room("kitchen")).unwrap();
        registry.upsert(DeviceRecord::new("d2")).unwrap();
        registry.set_room("d2", Some("kitchen".to_string())).unwrap();
        registry.upsert(DeviceRecord::new("d3").with_room("bath")).unwrap();

        assert_eq!(registry.room_ids(), ["bath", "kitchen"]);
        let ids: Vec<_> = registry
            .devices_in_room("kitchen")
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, ["d1", "d2"]);
    }

    #[tokio::test]
    async fn foreach_empty_match_is_not_found() {
        let registry = registry();
        let err = registry
            .foreach(&Context::new(), "nothing*", |_, _| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn foreach_collects_every_device() {
        let registry = registry();
        for id in ["d1", "d2", "d3"] {
            registry.upsert(DeviceRecord::new(id)).unwrap();
        }
        let results = registry
            .foreach(&Context::new(), "d*", |_, device| async move {
                if device.id() == "d2" {
                    Err(Error::Unreachable(device.id()))
                } else {
                    Ok(device.id().len())
                }
            })
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results["d1"].as_ref().ok(), Some(&2));
        assert!(matches!(results["d2"], Err(Error::Unreachable(_))));
        assert!(results["d3"].is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn foreach_cancels_children() {
        let registry = registry();
        for id in ["d1", "d2"] {
            registry.upsert(DeviceRecord::new(id)).unwrap();
        }
        let ctx = Context::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let results = registry
            .foreach(&ctx, "*", |ctx, _| async move {
                ctx.sleep(Duration::from_secs(60)).await
            })
            .await
            .unwrap();
        assert!(results.values().all(|r| matches!(r, Err(Error::Cancelled))));
    }
}
