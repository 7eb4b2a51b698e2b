// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Database schema and migrations

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the database schema
///
/// # Errors
///
/// Returns error if migration fails
pub fn init(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS devices (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL DEFAULT '',
            manufacturer TEXT NOT NULL DEFAULT '',
            model TEXT NOT NULL DEFAULT '',
            generation INTEGER NOT NULL DEFAULT 0,
            host TEXT NOT NULL DEFAULT '',
            mac TEXT NOT NULL DEFAULT '',
            room_id TEXT,
            last_seen TEXT,
            info TEXT
        );

        -- empty names are allowed many times
        CREATE UNIQUE INDEX IF NOT EXISTS idx_devices_name
            ON devices(name) WHERE name <> '';
        CREATE INDEX IF NOT EXISTS idx_devices_host ON devices(host);

        CREATE TABLE IF NOT EXISTS groups (
            name TEXT PRIMARY KEY,
            description TEXT NOT NULL DEFAULT '',
            kvs TEXT NOT NULL DEFAULT '{}'
        );

        CREATE TABLE IF NOT EXISTS group_members (
            group_name TEXT NOT NULL REFERENCES groups(name) ON DELETE CASCADE,
            device_id TEXT NOT NULL,
            PRIMARY KEY (group_name, device_id)
        );
        CREATE INDEX IF NOT EXISTS idx_group_members_device ON group_members(device_id);

        CREATE TABLE IF NOT EXISTS temperature_rooms (
            room_id TEXT PRIMARY KEY,
            name TEXT NOT NULL DEFAULT '',
            comfort_temp REAL NOT NULL,
            eco_temp REAL NOT NULL,
            weekday_schedule_json TEXT NOT NULL DEFAULT '[]',
            weekend_schedule_json TEXT NOT NULL DEFAULT '[]'
        );

        PRAGMA user_version = 1;
        ",
    )?;
    Ok(())
}

/// Adds the self-reported component list.
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        ALTER TABLE devices ADD COLUMN capabilities TEXT NOT NULL DEFAULT '[]';

        PRAGMA user_version = 2;
        ",
    )?;
    Ok(())
}
