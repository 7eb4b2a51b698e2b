// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::{ErrorBody, RpcServer, decode, to_value};
use crate::context::Context;
use crate::device::{Channel, Device, DeviceRecord};
use crate::error::{Error, Result};
use crate::method::{kvs, switch};
use crate::registry::{Registry, is_glob};
use crate::store::{Group, TemperatureRoom};

fn all() -> String {
    "*".to_string()
}

fn unknown(method: &str) -> Error {
    Error::BadRequest(format!("unknown method {method}"))
}

#[derive(Deserialize)]
struct IdentifierParams {
    identifier: String,
}

#[derive(Deserialize)]
struct MatchParams {
    #[serde(default = "all")]
    pattern: String,
}

#[derive(Deserialize)]
struct UpdateParams {
    device: DeviceRecord,
}

#[derive(Deserialize)]
struct SetRoomParams {
    identifier: String,
    #[serde(default)]
    room_id: Option<String>,
}

#[derive(Deserialize)]
struct CallParams {
    identifier: String,
    method: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    channel: Channel,
}

#[derive(Deserialize)]
struct ImportParams {
    devices: Vec<DeviceRecord>,
}

#[derive(Deserialize)]
struct GroupCreateParams {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    kvs: BTreeMap<String, Value>,
    #[serde(default)]
    devices: BTreeSet<String>,
}

#[derive(Deserialize)]
struct GroupNameParams {
    name: String,
}

#[derive(Deserialize)]
struct GroupMemberParams {
    name: String,
    identifier: String,
}

#[derive(Deserialize)]
struct SwitchParams {
    identifier: String,
    #[serde(default)]
    switch_id: u32,
}

#[derive(Deserialize)]
struct SwitchAllParams {
    #[serde(default = "all")]
    identifier: String,
    #[serde(default)]
    on: Option<bool>,
}

#[derive(Deserialize)]
struct RoomIdParams {
    room_id: String,
}

#[derive(Deserialize)]
struct SetpointParams {
    room_id: String,
    #[serde(default)]
    at: Option<NaiveDateTime>,
}

/// Row of `device.match`.
#[derive(Serialize)]
struct DeviceSummary {
    id: String,
    name: String,
    host: String,
    model: String,
    #[serde(rename = "gen")]
    generation: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    room_id: Option<String>,
}

impl From<&DeviceRecord> for DeviceSummary {
    fn from(record: &DeviceRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            host: record.host.clone(),
            model: record.model.clone(),
            generation: record.generation,
            room_id: record.room_id.clone(),
        }
    }
}

#[derive(Serialize)]
struct RoomSummary {
    room_id: String,
    name: String,
    devices: usize,
    heated: bool,
}

pub(super) async fn dispatch(
    server: &RpcServer,
    ctx: &Context,
    method: &str,
    params: Value,
) -> Result<Value> {
    let (namespace, verb) = method.split_once('.').ok_or_else(|| unknown(method))?;
    match namespace {
        "device" => device(server, ctx, method, verb, params).await,
        "group" => group(server, ctx, method, verb, params).await,
        "switch" => switches(server, ctx, method, verb, params).await,
        "temperature" => temperature(server, method, verb, params),
        "room" => room(server, method, verb, params),
        _ => Err(unknown(method)),
    }
}

/// Runs `f` on one device, or on every match of a glob.
async fn per_device<T, F, Fut>(
    registry: &Registry,
    ctx: &Context,
    identifier: &str,
    f: F,
) -> Result<Value>
where
    F: Fn(Context, Arc<Device>) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Serialize + Send + 'static,
{
    if is_glob(identifier) {
        let results = registry.foreach(ctx, identifier, f).await?;
        fan_out_value(results)
    } else {
        let device = registry.get(identifier)?;
        let value = f(ctx.clone(), device).await?;
        to_value(&value)
    }
}

fn fan_out_value<T: Serialize>(results: BTreeMap<String, Result<T>>) -> Result<Value> {
    let mut map = Map::with_capacity(results.len());
    for (id, result) in results {
        let entry = match result {
            Ok(value) => json!({ "result": to_value(&value)? }),
            Err(err) => json!({ "error": to_value(&ErrorBody::from(&err))? }),
        };
        map.insert(id, entry);
    }
    Ok(Value::Object(map))
}

async fn device(
    server: &RpcServer,
    ctx: &Context,
    method: &str,
    verb: &str,
    params: Value,
) -> Result<Value> {
    let registry = server.registry();
    match verb {
        "match" => {
            let p: MatchParams = decode(method, params)?;
            let summaries: Vec<_> = registry
                .match_pattern(&p.pattern)?
                .iter()
                .map(|d| DeviceSummary::from(&d.record()))
                .collect();
            to_value(&summaries)
        }
        "show" => {
            let p: IdentifierParams = decode(method, params)?;
            if is_glob(&p.identifier) {
                let records: Vec<_> = registry
                    .resolve(&p.identifier)?
                    .iter()
                    .map(|d| d.record())
                    .collect();
                to_value(&records)
            } else {
                to_value(&registry.get(&p.identifier)?.record())
            }
        }
        "update" => {
            let p: UpdateParams = decode(method, params)?;
            to_value(&registry.update(p.device)?.record())
        }
        "forget" => {
            let p: IdentifierParams = decode(method, params)?;
            to_value(&registry.forget(&p.identifier)?)
        }
        "set-room" => {
            let p: SetRoomParams = decode(method, params)?;
            to_value(&registry.set_room(&p.identifier, p.room_id)?)
        }
        "refresh" => {
            let p: IdentifierParams = decode(method, params)?;
            let shared = Arc::clone(registry);
            per_device(registry, ctx, &p.identifier, move |ctx, device| {
                let registry = Arc::clone(&shared);
                async move {
                    let record = device.refresh(&ctx).await?;
                    registry.persist(&device)?;
                    Ok(record)
                }
            })
            .await
        }
        "call" => {
            let p: CallParams = decode(method, params)?;
            registry.dispatcher().methods().lookup(&p.method)?;
            let CallParams {
                identifier,
                method: device_method,
                params,
                channel,
            } = p;
            per_device(registry, ctx, &identifier, move |ctx, device| {
                let method = device_method.clone();
                let params = params.clone();
                async move { device.call_value(&ctx, channel, &method, params).await }
            })
            .await
        }
        "import" => {
            let p: ImportParams = decode(method, params)?;
            to_value(&registry.import(p.devices)?)
        }
        _ => Err(unknown(method)),
    }
}

async fn group(
    server: &RpcServer,
    ctx: &Context,
    method: &str,
    verb: &str,
    params: Value,
) -> Result<Value> {
    let registry = server.registry();
    match verb {
        "create" => {
            let p: GroupCreateParams = decode(method, params)?;
            let group = Group {
                name: p.name,
                description: p.description,
                kvs: p.kvs,
                members: p.devices,
            };
            to_value(&registry.create_group(group)?)
        }
        "delete" => {
            let p: GroupNameParams = decode(method, params)?;
            registry.delete_group(&p.name)?;
            Ok(Value::Null)
        }
        "show" => {
            let p: GroupNameParams = decode(method, params)?;
            to_value(&registry.group(&p.name)?)
        }
        "list" => to_value(&registry.groups()?),
        "add-device" => {
            let p: GroupMemberParams = decode(method, params)?;
            let added = registry.add_to_group(&p.name, &p.identifier)?;
            Ok(json!({ "added": added }))
        }
        "remove-device" => {
            let p: GroupMemberParams = decode(method, params)?;
            let removed = registry.remove_from_group(&p.name, &p.identifier)?;
            Ok(json!({ "removed": removed }))
        }
        "sync" => {
            let p: GroupNameParams = decode(method, params)?;
            let group = registry.group(&p.name)?;
            let devices = registry.group_devices(&p.name)?;
            let kvs = Arc::new(group.kvs);
            let results = registry
                .foreach_devices(ctx, devices, move |ctx, device| {
                    let kvs = Arc::clone(&kvs);
                    async move {
                        let mut written = 0_usize;
                        for (key, value) in kvs.iter() {
                            let params = kvs::SetParams {
                                key: key.clone(),
                                value: value.clone(),
                            };
                            device.call::<kvs::Set>(&ctx, Channel::Default, &params).await?;
                            written += 1;
                        }
                        Ok(written)
                    }
                })
                .await?;
            fan_out_value(results)
        }
        _ => Err(unknown(method)),
    }
}

async fn switches(
    server: &RpcServer,
    ctx: &Context,
    method: &str,
    verb: &str,
    params: Value,
) -> Result<Value> {
    let registry = server.registry();
    match verb {
        "toggle" => {
            let p: SwitchParams = decode(method, params)?;
            let id = switch::SwitchId { id: p.switch_id };
            per_device(registry, ctx, &p.identifier, move |ctx, device| async move {
                device.call::<switch::Toggle>(&ctx, Channel::Default, &id).await
            })
            .await
        }
        "on" | "off" => {
            let p: SwitchParams = decode(method, params)?;
            let set = switch::SetParams {
                id: p.switch_id,
                on: verb == "on",
                toggle_after: None,
            };
            per_device(registry, ctx, &p.identifier, move |ctx, device| async move {
                device.call::<switch::Set>(&ctx, Channel::Default, &set).await
            })
            .await
        }
        "status" => {
            let p: SwitchParams = decode(method, params)?;
            let id = switch::SwitchId { id: p.switch_id };
            per_device(registry, ctx, &p.identifier, move |ctx, device| async move {
                device.call::<switch::GetStatus>(&ctx, Channel::Default, &id).await
            })
            .await
        }
        "all" => {
            let p: SwitchAllParams = decode(method, params)?;
            let devices: Vec<_> = registry
                .resolve(&p.identifier)?
                .into_iter()
                .filter(|d| !switch_ids(&d.record()).is_empty())
                .collect();
            let on = p.on;
            let results = registry
                .foreach_devices(ctx, devices, move |ctx, device| async move {
                    let mut statuses = Vec::new();
                    for id in switch_ids(&device.record()) {
                        let status = match on {
                            Some(on) => {
                                let set = switch::SetParams {
                                    id,
                                    on,
                                    toggle_after: None,
                                };
                                let previous = device
                                    .call::<switch::Set>(&ctx, Channel::Default, &set)
                                    .await?;
                                json!({ "id": id, "was_on": previous.was_on, "output": on })
                            }
                            None => {
                                let status = device
                                    .call::<switch::GetStatus>(
                                        &ctx,
                                        Channel::Default,
                                        &switch::SwitchId { id },
                                    )
                                    .await?;
                                to_value(&status)?
                            }
                        };
                        statuses.push(status);
                    }
                    Ok(statuses)
                })
                .await?;
            fan_out_value(results)
        }
        _ => Err(unknown(method)),
    }
}

/// Switch component indexes from `switch:<n>` capabilities.
fn switch_ids(record: &DeviceRecord) -> Vec<u32> {
    record
        .capabilities
        .iter()
        .filter_map(|key| key.strip_prefix("switch:")?.parse().ok())
        .collect()
}

fn temperature(server: &RpcServer, method: &str, verb: &str, params: Value) -> Result<Value> {
    let rooms = server.registry().rooms();
    let find = |room_id: &str| {
        rooms
            .get(room_id)?
            .ok_or_else(|| Error::NotFound(format!("room {room_id}")))
    };
    match verb {
        "get" => {
            let p: RoomIdParams = decode(method, params)?;
            to_value(&find(&p.room_id)?)
        }
        "set" => {
            let room: TemperatureRoom = decode(method, params)?;
            if room.room_id.is_empty() {
                return Err(Error::BadRequest("room_id is empty".to_string()));
            }
            rooms.upsert(&room)?;
            to_value(&room)
        }
        "list" => to_value(&rooms.list()?),
        "delete" => {
            let p: RoomIdParams = decode(method, params)?;
            if !rooms.delete(&p.room_id)? {
                return Err(Error::NotFound(format!("room {}", p.room_id)));
            }
            Ok(Value::Null)
        }
        "setpoint" => {
            let p: SetpointParams = decode(method, params)?;
            let room = find(&p.room_id)?;
            let at = p.at.unwrap_or_else(|| Local::now().naive_local());
            let comfort = room.is_comfort(at);
            Ok(json!({
                "room_id": room.room_id,
                "at": at,
                "setpoint": room.setpoint(at),
                "mode": if comfort { "comfort" } else { "eco" },
            }))
        }
        _ => Err(unknown(method)),
    }
}

fn room(server: &RpcServer, method: &str, verb: &str, params: Value) -> Result<Value> {
    let registry = server.registry();
    match verb {
        "list" => {
            let mut rooms: BTreeMap<String, RoomSummary> = BTreeMap::new();
            for heated in registry.rooms().list()? {
                rooms.insert(
                    heated.room_id.clone(),
                    RoomSummary {
                        room_id: heated.room_id,
                        name: heated.name,
                        devices: 0,
                        heated: true,
                    },
                );
            }
            for room_id in registry.room_ids() {
                let devices = registry.devices_in_room(&room_id).len();
                rooms
                    .entry(room_id.clone())
                    .or_insert_with(|| RoomSummary {
                        room_id,
                        name: String::new(),
                        devices: 0,
                        heated: false,
                    })
                    .devices = devices;
            }
            to_value(&rooms.into_values().collect::<Vec<_>>())
        }
        "devices" => {
            let p: RoomIdParams = decode(method, params)?;
            let summaries: Vec<_> = registry
                .devices_in_room(&p.room_id)
                .iter()
                .map(DeviceSummary::from)
                .collect();
            to_value(&summaries)
        }
        _ => Err(unknown(method)),
    }
}
