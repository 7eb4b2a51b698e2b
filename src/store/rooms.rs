// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Temperature rooms: comfort/eco setpoints with weekday and weekend schedules.

use chrono::{Datelike, NaiveDateTime, NaiveTime, Weekday};
use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use super::DbPool;
use crate::error::{Error, Result};

/// A daily time window, `"HH:MM"` on the wire.
///
/// A window whose end is not after its start wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

impl TimeRange {
    #[must_use]
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Returns whether `t` falls in `[start, end)`.
    #[must_use]
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start < self.end {
            self.start <= t && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }
}

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveTime::parse_from_str(&raw, FORMAT).map_err(serde::de::Error::custom)
    }
}

/// Heating settings of one room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureRoom {
    pub room_id: String,
    #[serde(default)]
    pub name: String,
    pub comfort_temp: f64,
    pub eco_temp: f64,
    /// Comfort windows Monday to Friday.
    #[serde(default)]
    pub weekday: Vec<TimeRange>,
    /// Comfort windows on Saturday and Sunday.
    #[serde(default)]
    pub weekend: Vec<TimeRange>,
}

impl TemperatureRoom {
    /// Returns the target temperature at local time `at`: comfort inside
    /// a window of the day's schedule, eco otherwise.
    ///
    /// # Examples
    ///
    /// ```
    /// use chrono::{NaiveDate, NaiveTime};
    /// use myhome::store::{TemperatureRoom, TimeRange};
    ///
    /// let room = TemperatureRoom {
    ///     room_id: "living".into(),
    ///     name: String::new(),
    ///     comfort_temp: 21.0,
    ///     eco_temp: 17.0,
    ///     weekday: vec![TimeRange::new(
    ///         NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
    ///         NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
    ///     )],
    ///     weekend: vec![],
    /// };
    /// // 2024-01-08 is a Monday
    /// let at = NaiveDate::from_ymd_opt(2024, 1, 8).unwrap().and_hms_opt(8, 0, 0).unwrap();
    /// assert_eq!(room.setpoint(at), 21.0);
    /// ```
    #[must_use]
    pub fn setpoint(&self, at: NaiveDateTime) -> f64 {
        if self.is_comfort(at) {
            self.comfort_temp
        } else {
            self.eco_temp
        }
    }

    /// Returns whether `at` falls in a comfort window.
    #[must_use]
    pub fn is_comfort(&self, at: NaiveDateTime) -> bool {
        let schedule = match at.weekday() {
            Weekday::Sat | Weekday::Sun => &self.weekend,
            _ => &self.weekday,
        };
        schedule.iter().any(|range| range.contains(at.time()))
    }
}

/// Temperature room repository
#[derive(Clone)]
pub struct TemperatureRoomRepo {
    pool: DbPool,
}

impl std::fmt::Debug for TemperatureRoomRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemperatureRoomRepo").finish_non_exhaustive()
    }
}

const COLUMNS: &str =
    "room_id, name, comfort_temp, eco_temp, weekday_schedule_json, weekend_schedule_json";

fn from_row(row: &Row<'_>) -> rusqlite::Result<TemperatureRoom> {
    let weekday: String = row.get(4)?;
    let weekend: String = row.get(5)?;
    Ok(TemperatureRoom {
        room_id: row.get(0)?,
        name: row.get(1)?,
        comfort_temp: row.get(2)?,
        eco_temp: row.get(3)?,
        weekday: serde_json::from_str(&weekday).unwrap_or_default(),
        weekend: serde_json::from_str(&weekend).unwrap_or_default(),
    })
}

impl TemperatureRoomRepo {
    /// Create a new temperature room repository
    #[must_use]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Inserts or replaces a room.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn upsert(&self, room: &TemperatureRoom) -> Result<()> {
        let encode = |ranges: &[TimeRange]| {
            serde_json::to_string(ranges).map_err(|e| Error::Internal(e.to_string()))
        };
        let weekday = encode(&room.weekday)?;
        let weekend = encode(&room.weekend)?;

        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO temperature_rooms (room_id, name, comfort_temp, eco_temp, weekday_schedule_json, weekend_schedule_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(room_id) DO UPDATE SET
                name = excluded.name,
                comfort_temp = excluded.comfort_temp,
                eco_temp = excluded.eco_temp,
                weekday_schedule_json = excluded.weekday_schedule_json,
                weekend_schedule_json = excluded.weekend_schedule_json",
            params![
                room.room_id,
                room.name,
                room.comfort_temp,
                room.eco_temp,
                weekday,
                weekend
            ],
        )?;
        Ok(())
    }

    /// Find room by id
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, room_id: &str) -> Result<Option<TemperatureRoom>> {
        let conn = self.pool.get()?;
        let room = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM temperature_rooms WHERE room_id = ?1"),
                [room_id],
                from_row,
            )
            .optional()?;
        Ok(room)
    }

    /// Lists every room, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list(&self) -> Result<Vec<TemperatureRoom>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM temperature_rooms ORDER BY room_id"
        ))?;
        let rooms = stmt
            .query_map([], from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rooms)
    }

    /// Deletes a room. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn delete(&self, room_id: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        let deleted = conn.execute("DELETE FROM temperature_rooms WHERE room_id = ?1", [room_id])?;
        Ok(deleted > 0)
    }
}
