//! Connection lifecycle: connect, role assignment, pairing, disconnect.
//!
//! `Connected → RoleAssigned(role) → Disconnected`, with zero or more
//! sessions attached while a role is held. Disconnect is terminal from any
//! state and cascades to sessions and link accounting.

use super::registry::Connection;
use super::{Outbound, Outbox, Relay};
use relay_core::{unix_millis, ConnectionId, RelayError, RelayResult, Role, ServerEvent};
use std::sync::atomic::Ordering;
use tracing::{debug, info};

impl Relay {
    /// Register a freshly accepted connection in the `Connected` state.
    pub async fn connect(&self, remote_addr: String, outbox: Outbox) -> ConnectionId {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.counters.connections.fetch_add(1, Ordering::Relaxed);
        info!(conn_id = id, remote = %remote_addr, "connection opened");
        self.state
            .lock()
            .await
            .registry
            .insert(Connection::new(id, remote_addr, outbox));
        id
    }

    /// Assign a role. Re-joining overwrites the previous assignment; a role
    /// switch ends the sessions held under the old role.
    pub async fn join(
        &self,
        id: ConnectionId,
        role: Role,
        external_id: String,
    ) -> RelayResult<ServerEvent> {
        let external_id = external_id.trim().to_string();

        let ended = {
            let mut state = self.state.lock().await;
            let previous =
                state
                    .registry
                    .register_role(id, role, external_id.clone(), unix_millis())?;
            if previous != Role::Unassigned && previous != role {
                let ended = state.sessions.teardown(id);
                state.notify_session_end(&ended, id, "peer changed role");
                ended
            } else {
                Vec::new()
            }
        };

        if !ended.is_empty() {
            let ids: Vec<String> = ended.into_iter().map(|s| s.id).collect();
            self.backpressure.discard_connection(id, &ids).await;
        }

        let counter = match role {
            Role::Controller => Some(&self.counters.controllers_joined),
            Role::Target => Some(&self.counters.targets_joined),
            Role::Unassigned => None,
        };
        if let Some(counter) = counter {
            counter.fetch_add(1, Ordering::Relaxed);
        }

        info!(conn_id = id, %role, external_id = %external_id, "joined");
        Ok(ServerEvent::Registered {
            role,
            id: external_id,
        })
    }

    /// Pair controller connection `controller` with the target currently
    /// holding `target_external_id`, returning the session id.
    ///
    /// The target is told about the pairing with `controller_paired`.
    pub async fn pair(
        &self,
        controller: ConnectionId,
        target_external_id: &str,
    ) -> RelayResult<String> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let target = state
            .registry
            .find_by_external_id(Role::Target, target_external_id)
            .ok_or_else(|| {
                RelayError::PeerNotFound(format!("target {target_external_id} is not connected"))
            })?;
        let paired = state.sessions.pair(&state.registry, controller, target)?;

        if let (Some(c), Some(t)) = (state.registry.get(controller), state.registry.get(target)) {
            let event = ServerEvent::ControllerPaired {
                controller_id: c.external_id.clone().unwrap_or_default(),
                session_id: paired.session_id.clone(),
            };
            if t.outbox.try_send(Outbound::new(event)).is_err() {
                debug!(conn_id = target, "controller_paired not delivered");
            }
        }

        info!(
            controller,
            target,
            session_id = %paired.session_id,
            created = paired.created,
            "paired"
        );
        Ok(paired.session_id)
    }

    /// Tear down a connection: registry entry, sessions, link accounting.
    ///
    /// Unknown ids are a no-op and return `None`.
    pub async fn disconnect(&self, id: ConnectionId) -> Option<Connection> {
        let (removed, ended) = {
            let mut state = self.state.lock().await;
            let removed = state.registry.unregister(id);
            let ended = state.sessions.teardown(id);
            state.notify_session_end(&ended, id, "peer disconnected");
            (removed, ended)
        };

        let ended_ids: Vec<String> = ended.into_iter().map(|s| s.id).collect();
        self.backpressure.discard_connection(id, &ended_ids).await;

        match &removed {
            Some(conn) => info!(
                conn_id = id,
                role = %conn.role,
                sessions_ended = ended_ids.len(),
                connected_secs = conn.connected_at.elapsed().as_secs(),
                "connection closed"
            ),
            None => debug!(conn_id = id, "disconnect for unknown connection"),
        }
        removed
    }
}
