// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Group repository

use std::collections::{BTreeMap, BTreeSet};

use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{DbConn, DbPool};
use crate::error::{Error, Result};

/// A named set of devices with settings mirrored to each member's KVS.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Key/value pairs pushed to members with `KVS.Set`.
    #[serde(default)]
    pub kvs: BTreeMap<String, Value>,
    #[serde(default)]
    pub members: BTreeSet<String>,
}

impl Group {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Group repository
#[derive(Clone)]
pub struct GroupRepo {
    pool: DbPool,
}

impl std::fmt::Debug for GroupRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupRepo").finish_non_exhaustive()
    }
}

fn members(conn: &DbConn, name: &str) -> Result<BTreeSet<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT device_id FROM group_members WHERE group_name = ?1 ORDER BY device_id",
    )?;
    let members = stmt
        .query_map([name], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    Ok(members)
}

fn parse_kvs(raw: &str) -> BTreeMap<String, Value> {
    serde_json::from_str(raw).unwrap_or_default()
}

impl GroupRepo {
    /// Create a new group repository
    #[must_use]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Creates a group with its members. Returns `false` if the name is taken.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn create(&self, group: &Group) -> Result<bool> {
        let kvs =
            serde_json::to_string(&group.kvs).map_err(|e| Error::Internal(e.to_string()))?;
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO groups (name, description, kvs) VALUES (?1, ?2, ?3)",
            params![group.name, group.description, kvs],
        )?;
        if inserted == 0 {
            return Ok(false);
        }
        for device_id in &group.members {
            tx.execute(
                "INSERT OR IGNORE INTO group_members (group_name, device_id) VALUES (?1, ?2)",
                params![group.name, device_id],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    /// Find group by name
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, name: &str) -> Result<Option<Group>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT name, description, kvs FROM groups WHERE name = ?1",
                [name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((name, description, kvs)) = row else {
            return Ok(None);
        };
        let members = members(&conn, &name)?;
        Ok(Some(Group {
            name,
            description,
            kvs: parse_kvs(&kvs),
            members,
        }))
    }

    /// Lists every group, ordered by name.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list(&self) -> Result<Vec<Group>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT name, description, kvs FROM groups ORDER BY name")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(name, description, kvs)| {
                let members = members(&conn, &name)?;
                Ok(Group {
                    name,
                    description,
                    kvs: parse_kvs(&kvs),
                    members,
                })
            })
            .collect()
    }

    /// Deletes a group and its memberships. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn delete(&self, name: &str) -> Result<bool> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM group_members WHERE group_name = ?1", [name])?;
        let deleted = tx.execute("DELETE FROM groups WHERE name = ?1", [name])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    /// Adds a device to a group. Adding an existing member is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the group does not exist.
    pub fn add_member(&self, name: &str, device_id: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM groups WHERE name = ?1)",
            [name],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(Error::NotFound(format!("group {name}")));
        }
        let added = conn.execute(
            "INSERT OR IGNORE INTO group_members (group_name, device_id) VALUES (?1, ?2)",
            params![name, device_id],
        )?;
        Ok(added > 0)
    }

    /// Removes a device from a group. Returns whether it was a member.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn remove_member(&self, name: &str, device_id: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        let removed = conn.execute(
            "DELETE FROM group_members WHERE group_name = ?1 AND device_id = ?2",
            params![name, device_id],
        )?;
        Ok(removed > 0)
    }

    /// Returns the names of the groups `device_id` belongs to.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn groups_of(&self, device_id: &str) -> Result<BTreeSet<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare_cached(
            "SELECT group_name FROM group_members WHERE device_id = ?1 ORDER BY group_name",
        )?;
        let groups = stmt
            .query_map([device_id], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::init_memory;

    fn repo() -> GroupRepo {
        GroupRepo::new(init_memory().unwrap())
    }

    #[test]
    fn create_and_get() {
        let repo = repo();
        let mut group = Group::new("downstairs");
        group.description = "ground floor".to_string();
        group.kvs.insert("night_mode".to_string(), Value::Bool(true));
        group.members.insert("d1".to_string());
        assert!(repo.create(&group).unwrap());

        assert_eq!(repo.get("downstairs").unwrap().unwrap(), group);
        assert!(repo.get("upstairs").unwrap().is_none());
    }

    #[test]
    fn create_twice_returns_false() {
        let repo = repo();
        assert!(repo.create(&Group::new("g")).unwrap());
        assert!(!repo.create(&Group::new("g")).unwrap());
    }

    #[test]
    fn membership_is_a_set() {
        let repo = repo();
        repo.create(&Group::new("g")).unwrap();
        assert!(repo.add_member("g", "d1").unwrap());
        assert!(!repo.add_member("g", "d1").unwrap());
        assert_eq!(repo.get("g").unwrap().unwrap().members.len(), 1);
        assert_eq!(repo.groups_of("d1").unwrap(), BTreeSet::from(["g".to_string()]));

        assert!(repo.remove_member("g", "d1").unwrap());
        assert!(!repo.remove_member("g", "d1").unwrap());
    }

    #[test]
    fn add_member_to_missing_group() {
        let err = repo().add_member("nope", "d1").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn delete_drops_memberships() {
        let repo = repo();
        let mut group = Group::new("g");
        group.members.insert("d1".to_string());
        repo.create(&group).unwrap();
        assert!(repo.delete("g").unwrap());
        assert!(repo.groups_of("d1").unwrap().is_empty());
        assert!(!repo.delete("g").unwrap());
    }

    #[test]
    fn list_is_ordered() {
        let repo = repo();
        repo.create(&Group::new("b")).unwrap();
        repo.create(&Group::new("a")).unwrap();
        let names: Vec<_> = repo.list().unwrap().into_iter().map(|g| g.name).collect();
        assert_eq!(names, ["a", "b"]);
    }
}
