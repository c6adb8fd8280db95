//! Controller/target session lifecycle.
//!
//! Sessions reference connections by id only; the registry owns the
//! connections. Pairing is idempotent per pair and non-exclusive: one target
//! may sit in sessions with several controllers.

use crate::relay::registry::ConnectionRegistry;
use relay_core::{ConnectionId, RelayError, RelayResult, Role};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info};

/// An active controller/target pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Deterministic id derived from the pair.
    pub id: String,
    pub controller_id: ConnectionId,
    pub target_id: ConnectionId,
    pub created_at: Instant,
}

impl Session {
    /// Whether `connection_id` is either side of this session.
    pub fn involves(&self, connection_id: ConnectionId) -> bool {
        self.controller_id == connection_id || self.target_id == connection_id
    }

    /// The side opposite `connection_id`, if it is a member.
    pub fn peer_of(&self, connection_id: ConnectionId) -> Option<ConnectionId> {
        if connection_id == self.controller_id {
            Some(self.target_id)
        } else if connection_id == self.target_id {
            Some(self.controller_id)
        } else {
            None
        }
    }
}

/// Result of a successful `pair` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paired {
    pub session_id: String,
    /// `false` when the pair already had a session.
    pub created: bool,
}

/// Manages all active sessions.
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: HashMap<String, Session>,
}

impl SessionManager {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pair a controller with a target.
    ///
    /// Both ids must be live in `registry` with the expected roles.
    pub fn pair(
        &mut self,
        registry: &ConnectionRegistry,
        controller_id: ConnectionId,
        target_id: ConnectionId,
    ) -> RelayResult<Paired> {
        if registry.role_of(controller_id) != Role::Controller {
            return Err(RelayError::PeerNotFound(format!(
                "connection {controller_id} is not a registered controller"
            )));
        }
        if registry.role_of(target_id) != Role::Target {
            return Err(RelayError::PeerNotFound(format!(
                "connection {target_id} is not a registered target"
            )));
        }

        let session_id = derive_session_id(controller_id, target_id);
        if self.sessions.contains_key(&session_id) {
            debug!(session_id = %session_id, "pair already has a session");
            return Ok(Paired {
                session_id,
                created: false,
            });
        }

        let session = Session {
            id: session_id.clone(),
            controller_id,
            target_id,
            created_at: Instant::now(),
        };
        info!(
            session_id = %session_id,
            controller = controller_id,
            target = target_id,
            "session created"
        );
        self.sessions.insert(session_id.clone(), session);

        Ok(Paired {
            session_id,
            created: true,
        })
    }

    /// Look up a session; `None` means the caller should fall back.
    pub fn resolve(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    /// Given one side of a session, return the other.
    pub fn resolve_peer(&self, connection_id: ConnectionId, session_id: &str) -> Option<ConnectionId> {
        self.resolve(session_id)?.peer_of(connection_id)
    }

    /// Remove every session referencing `connection_id`.
    pub fn teardown(&mut self, connection_id: ConnectionId) -> Vec<Session> {
        let ids: Vec<String> = self
            .sessions
            .values()
            .filter(|s| s.involves(connection_id))
            .map(|s| s.id.clone())
            .collect();

        let removed: Vec<Session> = ids
            .iter()
            .filter_map(|id| self.sessions.remove(id))
            .collect();

        if !removed.is_empty() {
            info!(conn_id = connection_id, count = removed.len(), "sessions torn down");
        }
        removed
    }

    /// Sessions in which `connection_id` takes part.
    #[cfg(test)]
    pub fn sessions_of(&self, connection_id: ConnectionId) -> Vec<&Session> {
        self.sessions
            .values()
            .filter(|s| s.involves(connection_id))
            .collect()
    }

    /// Get the number of active sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}

/// First 16 bytes of SHA-256 over the pair, hex-encoded (32 chars).
fn derive_session_id(controller_id: ConnectionId, target_id: ConnectionId) -> String {
    let digest = Sha256::digest(format!("{controller_id}:{target_id}").as_bytes());
    hex::encode(&digest[..16])
}
