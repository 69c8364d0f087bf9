use std::collections::{BTreeMap, HashMap};

use tracing::debug;
use uuid::Uuid;

use crate::protocol::UserId;

pub type ConnectionId = Uuid;

/// Presence of a single user. `online` is true exactly when at least one
/// connection is recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceEntry {
    connections: Vec<ConnectionId>,
    online: bool,
}

impl PresenceEntry {
    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Connections in registration order.
    pub fn connections(&self) -> &[ConnectionId] {
        &self.connections
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub came_online: bool,
    /// Set when the connection was previously bound to a different user.
    pub released: Option<Deregistration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deregistration {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
    pub went_offline: bool,
}

/// User identity to live connection bookkeeping.
///
/// Entries are kept after a user goes offline so the full status dump can
/// report known-but-offline users.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: BTreeMap<UserId, PresenceEntry>,
    owners: HashMap<ConnectionId, UserId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `connection_id` to `user_id`. Returns `None` when the user id is
    /// blank, in which case nothing changes.
    pub fn register(&mut self, user_id: &str, connection_id: ConnectionId) -> Option<Registration> {
        if user_id.trim().is_empty() {
            debug!(connection_id = %connection_id, "ignoring registration without user id");
            return None;
        }

        let released = match self.owners.get(&connection_id) {
            Some(owner) if owner == user_id => None,
            Some(_) => self.deregister(connection_id),
            None => None,
        };

        let entry = self.entries.entry(user_id.to_string()).or_default();
        let came_online = entry.connections.is_empty();
        if !entry.connections.contains(&connection_id) {
            entry.connections.push(connection_id);
        }
        entry.online = true;
        self.owners.insert(connection_id, user_id.to_string());

        Some(Registration {
            came_online,
            released,
        })
    }

    /// Forget `connection_id`. Returns `None` when the connection was never
    /// bound to a user.
    pub fn deregister(&mut self, connection_id: ConnectionId) -> Option<Deregistration> {
        let user_id = self.owners.remove(&connection_id)?;
        let mut went_offline = false;
        if let Some(entry) = self.entries.get_mut(&user_id) {
            entry.connections.retain(|id| *id != connection_id);
            if entry.connections.is_empty() && entry.online {
                entry.online = false;
                went_offline = true;
            }
        }

        Some(Deregistration {
            user_id,
            connection_id,
            went_offline,
        })
    }

    /// Drop every recorded connection for which `is_open` is false.
    pub fn reconcile<F>(&mut self, is_open: F) -> Vec<Deregistration>
    where
        F: Fn(&ConnectionId) -> bool,
    {
        let stale: Vec<ConnectionId> = self
            .owners
            .keys()
            .filter(|id| !is_open(id))
            .copied()
            .collect();

        stale
            .into_iter()
            .filter_map(|id| self.deregister(id))
            .collect()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.entries
            .get(user_id)
            .map(PresenceEntry::is_online)
            .unwrap_or(false)
    }

    pub fn connections_of(&self, user_id: &str) -> &[ConnectionId] {
        self.entries
            .get(user_id)
            .map(PresenceEntry::connections)
            .unwrap_or(&[])
    }

    pub fn user_of(&self, connection_id: &ConnectionId) -> Option<&UserId> {
        self.owners.get(connection_id)
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.online)
            .map(|(user_id, _)| user_id.clone())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<(UserId, bool)> {
        self.entries
            .iter()
            .map(|(user_id, entry)| (user_id.clone(), entry.online))
            .collect()
    }

    pub fn recorded_connections(&self) -> usize {
        self.owners.len()
    }
}
