//! Connection registry.
//!
//! Tracks every live connection with its declared role and external id.
//! The `(role, external_id)` index is last-write-wins: a newer registration
//! under the same name takes over lookups from an older live holder.

use super::Outbox;
use relay_core::{ConnectionId, RelayError, RelayResult, Role, TargetInfo};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info};

/// A live transport-level connection.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Transport-assigned id.
    pub id: ConnectionId,
    /// Declared role.
    pub role: Role,
    /// Client-supplied logical id, set on role assignment.
    pub external_id: Option<String>,
    /// Remote address, informational only.
    pub remote_addr: String,
    /// When the transport accepted the connection.
    pub connected_at: Instant,
    /// Unix milliseconds of the last role assignment.
    pub joined_at: Option<u64>,
    /// Outbound queue feeding this connection's writer.
    pub outbox: Outbox,
}

impl Connection {
    /// Create an unassigned connection.
    pub fn new(id: ConnectionId, remote_addr: String, outbox: Outbox) -> Self {
        Self {
            id,
            role: Role::Unassigned,
            external_id: None,
            remote_addr,
            connected_at: Instant::now(),
            joined_at: None,
            outbox,
        }
    }

    /// Describe this connection as a `targets_list` entry.
    pub fn target_info(&self) -> TargetInfo {
        TargetInfo {
            target_id: self.external_id.clone().unwrap_or_default(),
            address: self.remote_addr.clone(),
            joined_at: self.joined_at.unwrap_or(0),
        }
    }
}

/// Registry of live connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
    /// Lookup index: (role, external id) -> newest holder.
    by_external: HashMap<(Role, String), ConnectionId>,
}

impl ConnectionRegistry {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a freshly accepted connection.
    pub fn insert(&mut self, connection: Connection) {
        debug!(conn_id = connection.id, remote = %connection.remote_addr, "connection registered");
        self.connections.insert(connection.id, connection);
    }

    /// Assign a role and external id, returning the previous role.
    ///
    /// Repeating the call overwrites the earlier assignment.
    pub fn register_role(
        &mut self,
        id: ConnectionId,
        role: Role,
        external_id: String,
        joined_at: u64,
    ) -> RelayResult<Role> {
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or(RelayError::UnknownConnection(id))?;

        let previous_role = conn.role;
        let previous_key = conn.external_id.take().map(|ext| (previous_role, ext));

        conn.role = role;
        conn.external_id = Some(external_id.clone());
        conn.joined_at = Some(joined_at);

        if let Some(key) = previous_key {
            self.release_slot(id, key);
        }

        if let Some(superseded) = self.by_external.insert((role, external_id.clone()), id) {
            if superseded != id {
                info!(
                    conn_id = id,
                    superseded,
                    %role,
                    external_id = %external_id,
                    "external id taken over by newer connection"
                );
            }
        }

        Ok(previous_role)
    }

    /// Remove a connection, returning it so the caller can cascade teardown.
    pub fn unregister(&mut self, id: ConnectionId) -> Option<Connection> {
        let conn = self.connections.remove(&id)?;
        if let Some(ext) = conn.external_id.clone() {
            self.release_slot(id, (conn.role, ext));
        }
        debug!(conn_id = id, "connection unregistered");
        Some(conn)
    }

    /// Drop `id`'s claim on `key`; hand the slot to the newest remaining
    /// connection with the same role and external id, if any.
    fn release_slot(&mut self, id: ConnectionId, key: (Role, String)) {
        if self.by_external.get(&key) != Some(&id) {
            return;
        }
        self.by_external.remove(&key);

        let fallback = self
            .connections
            .values()
            .filter(|c| c.id != id && c.role == key.0 && c.external_id.as_ref() == Some(&key.1))
            .max_by_key(|c| (c.joined_at, c.id))
            .map(|c| c.id);

        if let Some(next) = fallback {
            debug!(conn_id = next, external_id = %key.1, "external id reverted to older connection");
            self.by_external.insert(key, next);
        }
    }

    /// Resolve a logical name to the newest live connection holding it.
    pub fn find_by_external_id(&self, role: Role, external_id: &str) -> Option<ConnectionId> {
        self.by_external
            .get(&(role, external_id.to_string()))
            .copied()
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Role of a connection; unknown ids read as `Unassigned`.
    pub fn role_of(&self, id: ConnectionId) -> Role {
        self.connections
            .get(&id)
            .map(|c| c.role)
            .unwrap_or(Role::Unassigned)
    }

    /// Number of live connections holding `role`.
    pub fn count_by_role(&self, role: Role) -> usize {
        self.connections.values().filter(|c| c.role == role).count()
    }

    /// Snapshot of the connections holding `role`, oldest join first.
    pub fn list_by_role(&self, role: Role) -> Vec<Connection> {
        let mut list: Vec<Connection> = self
            .connections
            .values()
            .filter(|c| c.role == role)
            .cloned()
            .collect();
        list.sort_by_key(|c| (c.joined_at, c.id));
        list
    }

    /// Total live connections, any role.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn conn(id: ConnectionId) -> Connection {
        let (tx, _rx) = mpsc::channel(1);
        Connection::new(id, format!("127.0.0.1:{}", 40000 + id), tx)
    }

    #[test]
    fn register_and_find() {
        let mut reg = ConnectionRegistry::new();
        reg.insert(conn(1));
        let prev = reg
            .register_role(1, Role::Target, "t1".into(), 10)
            .unwrap();
        assert_eq!(prev, Role::Unassigned);
        assert_eq!(reg.find_by_external_id(Role::Target, "t1"), Some(1));
        assert_eq!(reg.find_by_external_id(Role::Controller, "t1"), None);
        assert_eq!(reg.count_by_role(Role::Target), 1);
    }

    #[test]
    fn register_unknown_connection() {
        let mut reg = ConnectionRegistry::new();
        let err = reg
            .register_role(9, Role::Target, "t1".into(), 0)
            .unwrap_err();
        assert!(matches!(err, RelayError::UnknownConnection(9)));
    }

    #[test]
    fn reregister_overwrites() {
        let mut reg = ConnectionRegistry::new();
        reg.insert(conn(1));
        reg.register_role(1, Role::Target, "t1".into(), 10).unwrap();
        let prev = reg
            .register_role(1, Role::Controller, "c1".into(), 20)
            .unwrap();
        assert_eq!(prev, Role::Target);
        assert_eq!(reg.find_by_external_id(Role::Target, "t1"), None);
        assert_eq!(reg.find_by_external_id(Role::Controller, "c1"), Some(1));
        assert_eq!(reg.count_by_role(Role::Target), 0);
        assert_eq!(reg.count_by_role(Role::Controller), 1);
    }

    #[test]
    fn external_id_last_write_wins() {
        let mut reg = ConnectionRegistry::new();
        reg.insert(conn(1));
        reg.insert(conn(2));
        reg.register_role(1, Role::Target, "t1".into(), 10).unwrap();
        reg.register_role(2, Role::Target, "t1".into(), 20).unwrap();
        assert_eq!(reg.find_by_external_id(Role::Target, "t1"), Some(2));
        // Both stay registered; only the lookup moved.
        assert_eq!(reg.count_by_role(Role::Target), 2);
    }

    #[test]
    fn unregister_reverts_lookup_to_older_holder() {
        let mut reg = ConnectionRegistry::new();
        reg.insert(conn(1));
        reg.insert(conn(2));
        reg.register_role(1, Role::Target, "t1".into(), 10).unwrap();
        reg.register_role(2, Role::Target, "t1".into(), 20).unwrap();

        let removed = reg.unregister(2).unwrap();
        assert_eq!(removed.id, 2);
        assert_eq!(reg.find_by_external_id(Role::Target, "t1"), Some(1));

        reg.unregister(1);
        assert_eq!(reg.find_by_external_id(Role::Target, "t1"), None);
    }

    #[test]
    fn unregister_older_holder_keeps_newer_lookup() {
        let mut reg = ConnectionRegistry::new();
        reg.insert(conn(1));
        reg.insert(conn(2));
        reg.register_role(1, Role::Target, "t1".into(), 10).unwrap();
        reg.register_role(2, Role::Target, "t1".into(), 20).unwrap();
        reg.unregister(1);
        assert_eq!(reg.find_by_external_id(Role::Target, "t1"), Some(2));
    }

    #[test]
    fn unregister_unknown_is_noop() {
        let mut reg = ConnectionRegistry::new();
        assert!(reg.unregister(42).is_none());
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn list_by_role_is_a_snapshot() {
        let mut reg = ConnectionRegistry::new();
        for id in 1..=3 {
            reg.insert(conn(id));
            reg.register_role(id, Role::Target, format!("t{id}"), id * 10)
                .unwrap();
        }
        let snapshot = reg.list_by_role(Role::Target);
        reg.unregister(2);
        let ids: Vec<_> = snapshot.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(reg.list_by_role(Role::Target).len(), 2);
    }
}
