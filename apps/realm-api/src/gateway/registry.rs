//! Connection registry: the primary map plus user, realm, and channel indices.
//!
//! Owned exclusively by the hub task, so nothing here locks. Every index entry
//! is mirrored by the connection's own membership set, which lets removal
//! prune every index without scanning.

use std::collections::{HashMap, HashSet, VecDeque};

use realm_common::ConnectionId;

use super::connection::Connection;

/// How many retired connection ids are remembered for duplicate detection.
const MAX_RETIRED_IDS: usize = 4096;

/// A named set of connections that can be published to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Group {
    Realm(String),
    Channel(String),
}

impl Group {
    pub fn realm(id: impl Into<String>) -> Self {
        Self::Realm(id.into())
    }

    pub fn channel(id: impl Into<String>) -> Self {
        Self::Channel(id.into())
    }
}

/// Who a publish is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    All,
    User(String),
    Group(Group),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    AlreadyRegistered(ConnectionId),
    #[error("connection {0} was already retired")]
    Retired(ConnectionId),
}

/// Point-in-time counts, served by `/health`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RegistryStats {
    pub connections: usize,
    pub users: usize,
    pub realms: usize,
    pub channels: usize,
}

struct Entry {
    conn: Connection,
    groups: HashSet<Group>,
}

type Index = HashMap<String, HashSet<ConnectionId>>;

#[derive(Default)]
pub struct Registry {
    connections: HashMap<ConnectionId, Entry>,
    by_user: Index,
    by_realm: Index,
    by_channel: Index,
    retired: RetiredIds,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, conn: Connection) -> Result<(), RegistryError> {
        let id = conn.id();
        if self.connections.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }
        if self.retired.contains(&id) {
            return Err(RegistryError::Retired(id));
        }
        self.by_user
            .entry(conn.user_id().to_string())
            .or_default()
            .insert(id);
        self.connections.insert(
            id,
            Entry {
                conn,
                groups: HashSet::new(),
            },
        );
        Ok(())
    }

    /// Remove the connection from the primary map and every index. Returns the
    /// connection so the caller decides when its queue closes; `None` if it was
    /// not registered.
    pub fn remove(&mut self, id: &ConnectionId) -> Option<Connection> {
        let entry = self.connections.remove(id)?;
        unindex(&mut self.by_user, entry.conn.user_id(), id);
        for group in &entry.groups {
            let (index, key) = self.index_mut(group);
            unindex(index, key, id);
        }
        self.retired.insert(*id);
        Some(entry.conn)
    }

    /// Add a registered connection to a group. Unknown ids are ignored so no
    /// membership can outlive its connection.
    pub fn join(&mut self, id: &ConnectionId, group: Group) -> bool {
        let Some(entry) = self.connections.get_mut(id) else {
            return false;
        };
        if !entry.groups.insert(group.clone()) {
            return false;
        }
        let (index, key) = match &group {
            Group::Realm(key) => (&mut self.by_realm, key),
            Group::Channel(key) => (&mut self.by_channel, key),
        };
        index.entry(key.clone()).or_default().insert(*id);
        true
    }

    pub fn leave(&mut self, id: &ConnectionId, group: &Group) -> bool {
        let Some(entry) = self.connections.get_mut(id) else {
            return false;
        };
        if !entry.groups.remove(group) {
            return false;
        }
        let (index, key) = self.index_mut(group);
        unindex(index, key, id);
        true
    }

    /// Snapshot of the ids a publish to `target` reaches.
    pub fn recipients(&self, target: &Target) -> Vec<ConnectionId> {
        let set = match target {
            Target::All => return self.connections.keys().copied().collect(),
            Target::User(user_id) => self.by_user.get(user_id),
            Target::Group(Group::Realm(key)) => self.by_realm.get(key),
            Target::Group(Group::Channel(key)) => self.by_channel.get(key),
        };
        set.map(|s| s.iter().copied().collect()).unwrap_or_default()
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&Connection> {
        self.connections.get(id).map(|e| &e.conn)
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn group_size(&self, group: &Group) -> usize {
        let index = match group {
            Group::Realm(_) => &self.by_realm,
            Group::Channel(_) => &self.by_channel,
        };
        index.get(group_key(group)).map_or(0, HashSet::len)
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            connections: self.connections.len(),
            users: self.by_user.len(),
            realms: self.by_realm.len(),
            channels: self.by_channel.len(),
        }
    }

    /// Remove every connection, e.g. when the hub shuts down.
    pub fn drain(&mut self) -> Vec<Connection> {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }

    fn index_mut<'a>(&mut self, group: &'a Group) -> (&mut Index, &'a str) {
        match group {
            Group::Realm(key) => (&mut self.by_realm, key),
            Group::Channel(key) => (&mut self.by_channel, key),
        }
    }

    /// Panics if any index names a connection that is not in the primary map,
    /// or a membership is missing from its index.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        for (name, index) in [
            ("user", &self.by_user),
            ("realm", &self.by_realm),
            ("channel", &self.by_channel),
        ] {
            for (key, ids) in index {
                assert!(!ids.is_empty(), "empty {name} set left for {key}");
                for id in ids {
                    assert!(
                        self.connections.contains_key(id),
                        "{name} index {key} holds dangling {id}"
                    );
                }
            }
        }
        for (id, entry) in &self.connections {
            assert!(self.by_user[entry.conn.user_id()].contains(id));
            for group in &entry.groups {
                let index = match group {
                    Group::Realm(_) => &self.by_realm,
                    Group::Channel(_) => &self.by_channel,
                };
                assert!(index[group_key(group)].contains(id));
            }
        }
    }
}

fn group_key(group: &Group) -> &str {
    match group {
        Group::Realm(key) | Group::Channel(key) => key,
    }
}

fn unindex(index: &mut Index, key: &str, id: &ConnectionId) {
    if let Some(ids) = index.get_mut(key) {
        ids.remove(id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

/// Bounded memory of removed ids, oldest forgotten first.
#[derive(Default)]
struct RetiredIds {
    order: VecDeque<ConnectionId>,
    set: HashSet<ConnectionId>,
}

impl RetiredIds {
    fn insert(&mut self, id: ConnectionId) {
        if !self.set.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > MAX_RETIRED_IDS {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
    }

    fn contains(&self, id: &ConnectionId) -> bool {
        self.set.contains(id)
    }
}
