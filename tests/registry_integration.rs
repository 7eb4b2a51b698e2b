// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Registry tests against an on-disk database that is reopened between
//! steps.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use myhome::method::MethodRegistry;
use myhome::protocol::{HttpChannel, HttpConfig, RateLimiter};
use myhome::server::Request;
use myhome::store::{Group, TemperatureRoom, TimeRange};
use myhome::{Context, DeviceRecord, Dispatcher, Registry, RpcServer};
use serde_json::json;

/// Removes the database file when dropped.
struct TempDb(PathBuf);

impl TempDb {
    fn new(name: &str) -> Self {
        let path = std::env::temp_dir().join(format!("myhome-{}-{name}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);
        Self(path)
    }

    fn open(&self) -> Registry {
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(MethodRegistry::standard().unwrap()),
            HttpChannel::new(&HttpConfig::new()).unwrap(),
            None,
            RateLimiter::new(Duration::ZERO),
        ));
        let registry = Registry::new(myhome::store::init(&self.0).unwrap(), dispatcher);
        registry.load().unwrap();
        registry
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

fn fleet() -> Vec<DeviceRecord> {
    vec![
        DeviceRecord::new("shellyblugw-b0b21c1a2b3c").with_host("192.0.2.21"),
        DeviceRecord::new("shellyplus1-a8032ab12345").with_name("porch"),
        DeviceRecord::new("shellyblu-aabbccddeeff").with_mac("AA:BB:CC:DD:EE:FF"),
        DeviceRecord::new("shelly1minig3-54320464a1d0").with_host("192.0.2.10"),
        DeviceRecord::new("shellyblu-112233445566").with_room("kitchen"),
    ]
}

// ============================================================================
// Persistence Tests
// ============================================================================

mod persistence {
    use super::*;

    #[tokio::test]
    async fn imported_devices_survive_reopen() {
        let db = TempDb::new("import");
        {
            let registry = db.open();
            let ids = registry.import(fleet()).unwrap();
            assert_eq!(ids.len(), 5);
        }

        let registry = db.open();
        assert_eq!(registry.len(), 5);
        let server = RpcServer::new(Arc::new(registry));

        let response = server
            .handle(
                &Context::new(),
                Request::new("device.match", json!({"pattern": "shellyblu*"})),
            )
            .await;
        let ids: Vec<String> = response
            .result
            .unwrap()
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            ids,
            [
                "shellyblu-112233445566",
                "shellyblu-aabbccddeeff",
                "shellyblugw-b0b21c1a2b3c",
            ]
        );
    }

    #[tokio::test]
    async fn names_rooms_and_lookups_survive_reopen() {
        let db = TempDb::new("lookups");
        db.open().import(fleet()).unwrap();

        let registry = db.open();
        assert_eq!(registry.get("porch").unwrap().id(), "shellyplus1-a8032ab12345");
        assert_eq!(registry.get("192.0.2.10").unwrap().id(), "shelly1minig3-54320464a1d0");
        assert_eq!(registry.get("aabbccddeeff").unwrap().id(), "shellyblu-aabbccddeeff");
        assert_eq!(registry.devices_in_room("kitchen")[0].id, "shellyblu-112233445566");
    }

    #[tokio::test]
    async fn forget_is_persisted() {
        let db = TempDb::new("forget");
        db.open().import(fleet()).unwrap();
        db.open().forget("porch").unwrap();

        let registry = db.open();
        assert_eq!(registry.len(), 4);
        assert!(registry.get("porch").is_err());
    }

    #[tokio::test]
    async fn groups_survive_reopen() {
        let db = TempDb::new("groups");
        {
            let registry = db.open();
            registry.import(fleet()).unwrap();
            let mut group = Group::new("blu");
            group.members.insert("shellyblu-aabbccddeeff".to_string());
            group.kvs.insert("night_mode".to_string(), json!(true));
            registry.create_group(group).unwrap();
            registry.add_to_group("blu", "shellyblu-112233445566").unwrap();
        }

        let registry = db.open();
        let group = registry.group("blu").unwrap();
        assert_eq!(group.members.len(), 2);
        assert_eq!(group.kvs["night_mode"], json!(true));
        assert!(
            registry
                .get("shellyblu-aabbccddeeff")
                .unwrap()
                .record()
                .groups
                .contains("blu")
        );
    }

    #[tokio::test]
    async fn temperature_rooms_survive_reopen() {
        let db = TempDb::new("rooms");
        {
            let registry = db.open();
            let room = TemperatureRoom {
                room_id: "office".to_string(),
                name: "Office".to_string(),
                comfort_temp: 21.0,
                eco_temp: 17.0,
                weekday: vec![TimeRange::new(
                    chrono::NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
                    chrono::NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
                )],
                weekend: Vec::new(),
            };
            registry.rooms().upsert(&room).unwrap();
        }

        let registry = db.open();
        let room = registry.rooms().get("office").unwrap().unwrap();
        assert_eq!(room.weekday.len(), 1);
        assert!((room.comfort_temp - 21.0).abs() < f64::EPSILON);
    }
}
