// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device repository

use std::collections::BTreeSet;

use rusqlite::{OptionalExtension, Row, params};

use super::{DbConn, DbPool, parse_datetime};
use crate::device::DeviceRecord;
use crate::error::{Error, Result};

const COLUMNS: &str =
    "id, name, manufacturer, model, generation, host, mac, room_id, last_seen, info, capabilities";

/// Device repository
#[derive(Clone)]
pub struct DeviceRepo {
    pool: DbPool,
}

impl std::fmt::Debug for DeviceRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRepo").finish_non_exhaustive()
    }
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<DeviceRecord> {
    let info: Option<String> = row.get(9)?;
    let capabilities: String = row.get(10)?;
    Ok(DeviceRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        manufacturer: row.get(2)?,
        model: row.get(3)?,
        generation: row.get(4)?,
        host: row.get(5)?,
        mac: row.get(6)?,
        room_id: row.get(7)?,
        last_seen: row
            .get::<_, Option<String>>(8)?
            .as_deref()
            .and_then(parse_datetime),
        info: info.and_then(|s| serde_json::from_str(&s).ok()),
        capabilities: serde_json::from_str(&capabilities).unwrap_or_default(),
        groups: BTreeSet::new(),
    })
}

fn load_groups(conn: &DbConn, record: &mut DeviceRecord) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "SELECT group_name FROM group_members WHERE device_id = ?1 ORDER BY group_name",
    )?;
    record.groups = stmt
        .query_map([&record.id], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    Ok(())
}

impl DeviceRepo {
    /// Create a new device repository
    #[must_use]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Inserts or replaces a device by id.
    ///
    /// Group membership is not written here; see
    /// [`GroupRepo`](super::GroupRepo).
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadRequest`] if the non-empty name is taken by
    /// another device, [`Error::Storage`] for other database failures.
    pub fn upsert(&self, record: &DeviceRecord) -> Result<()> {
        let conn = self.pool.get()?;
        let info = record.info.as_ref().map(ToString::to_string);
        let capabilities = serde_json::to_string(&record.capabilities)
            .map_err(|e| Error::Internal(e.to_string()))?;

        conn.execute(
            "INSERT INTO devices (id, name, manufacturer, model, generation, host, mac, room_id, last_seen, info, capabilities)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                manufacturer = excluded.manufacturer,
                model = excluded.model,
                generation = excluded.generation,
                host = excluded.host,
                mac = excluded.mac,
                room_id = excluded.room_id,
                last_seen = excluded.last_seen,
                info = excluded.info,
                capabilities = excluded.capabilities",
            params![
                record.id,
                record.name,
                record.manufacturer,
                record.model,
                record.generation,
                record.host,
                record.mac,
                record.room_id,
                record.last_seen.map(|t| t.to_rfc3339()),
                info,
                capabilities,
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(f, _)
                if f.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::BadRequest(format!("device name {:?} is already taken", record.name))
            }
            other => other.into(),
        })?;
        Ok(())
    }

    /// Finds a device by id.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, id: &str) -> Result<Option<DeviceRecord>> {
        let conn = self.pool.get()?;
        let record = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM devices WHERE id = ?1"),
                [id],
                from_row,
            )
            .optional()?;
        match record {
            Some(mut record) => {
                load_groups(&conn, &mut record)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Lists every device, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list(&self) -> Result<Vec<DeviceRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM devices ORDER BY id"))?;
        let mut records = stmt
            .query_map([], from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for record in &mut records {
            load_groups(&conn, record)?;
        }
        Ok(records)
    }

    /// Deletes a device and its group memberships. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn delete(&self, id: &str) -> Result<bool> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM group_members WHERE device_id = ?1", [id])?;
        let deleted = tx.execute("DELETE FROM devices WHERE id = ?1", [id])?;
        tx.commit()?;
        Ok(deleted > 0)
    }
}
