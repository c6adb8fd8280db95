//! Message routing between paired peers.
//!
//! Control-class traffic flows controller → target, data-class traffic
//! target → controller. A payload whose `session_id` resolves to a session
//! the sender belongs to goes to the paired peer only; anything else is
//! broadcast to every live connection of the opposite role. Data-class
//! frames pass admission control first and are dropped silently when the
//! link is saturated.

use super::backpressure::{Direction, LinkKey};
use super::registry::Connection;
use super::{deliver, Outbound, Outbox, Relay, RelayState};
use relay_core::{
    unix_millis, ConnectionId, Forwarded, RelayError, RelayResult, Role, Routed, ServerEvent,
    TargetInfo,
};
use std::sync::Arc;
use tracing::debug;

/// Controller-issued event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    ControlEvent,
    TerminalCommand,
    ScreenshotRequest,
}

impl ControlKind {
    fn forward(self, payload: Forwarded) -> ServerEvent {
        match self {
            ControlKind::ControlEvent => ServerEvent::ControlCommand(payload),
            ControlKind::TerminalCommand => ServerEvent::ExecuteTerminal(payload),
            ControlKind::ScreenshotRequest => ServerEvent::TakeScreenshot(payload),
        }
    }
}

/// Target-issued event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    ScreenData,
    ScreenshotData,
    TerminalOutput,
}

impl DataKind {
    fn forward(self, payload: Forwarded) -> ServerEvent {
        match self {
            DataKind::ScreenData => ServerEvent::ScreenUpdate(payload),
            DataKind::ScreenshotData => ServerEvent::ScreenshotResponse(payload),
            DataKind::TerminalOutput => ServerEvent::TerminalResponse(payload),
        }
    }
}

/// What happened to a routed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Sender lacks the role for this traffic class.
    Ignored,
    /// Refused by admission control.
    Dropped,
    /// Handed to this many recipient queues.
    Delivered(usize),
}

impl RouteOutcome {
    /// Recipient count, or the silent failure as a [`RelayError`].
    pub fn into_result(self, event: &str) -> RelayResult<usize> {
        match self {
            RouteOutcome::Delivered(n) => Ok(n),
            RouteOutcome::Ignored => Err(RelayError::NotAuthorized(format!(
                "{event} requires the opposite role"
            ))),
            RouteOutcome::Dropped => Err(RelayError::Overloaded(format!(
                "{event} shed, consumer behind"
            ))),
        }
    }

    /// Trace a payload that reached nobody. The sender is never told.
    pub(super) fn log_unrouted(self, conn_id: ConnectionId, event: &str) {
        match self.into_result(event) {
            Ok(0) => debug!(conn_id, event, "no recipients"),
            Ok(_) => {}
            Err(e) => debug!(conn_id, error = %e, "event not forwarded"),
        }
    }
}

/// Resolved destination set, captured under the state lock.
struct Recipients {
    /// Set when the fast path applied.
    session_id: Option<String>,
    outboxes: Vec<Outbox>,
}

impl RelayState {
    fn recipients(
        &self,
        sender: ConnectionId,
        session_hint: Option<&str>,
        peer_role: Role,
    ) -> Recipients {
        if let Some(session_id) = session_hint {
            let peer = self
                .sessions
                .resolve_peer(sender, session_id)
                .and_then(|peer| self.registry.get(peer));
            if let Some(conn) = peer {
                return Recipients {
                    session_id: Some(session_id.to_string()),
                    outboxes: vec![conn.outbox.clone()],
                };
            }
        }

        Recipients {
            session_id: None,
            outboxes: self
                .registry
                .list_by_role(peer_role)
                .into_iter()
                .map(|c| c.outbox)
                .collect(),
        }
    }

    /// External id of `sender` if it currently holds `role`.
    fn sender_as(&self, sender: ConnectionId, role: Role) -> Option<Option<String>> {
        self.registry
            .get(sender)
            .filter(|c| c.role == role)
            .map(|c| c.external_id.clone())
    }
}

impl Relay {
    /// Route a controller → target payload.
    pub async fn route_control(
        &self,
        sender: ConnectionId,
        kind: ControlKind,
        payload: Routed,
    ) -> RouteOutcome {
        let received_at = unix_millis();

        let (source_id, recipients) = {
            let state = self.state.lock().await;
            let Some(source_id) = state.sender_as(sender, Role::Controller) else {
                debug!(conn_id = sender, ?kind, "control event from non-controller ignored");
                return RouteOutcome::Ignored;
            };
            let recipients = state.recipients(sender, payload.session_id.as_deref(), Role::Target);
            (source_id, recipients)
        };

        let event = kind.forward(Forwarded::stamp(payload, source_id, received_at));
        let delivered = deliver(&recipients.outboxes, &Outbound::new(event));
        debug!(
            conn_id = sender,
            ?kind,
            session_id = recipients.session_id.as_deref().unwrap_or("-"),
            delivered,
            "control routed"
        );
        RouteOutcome::Delivered(delivered)
    }

    /// Route a target → controller payload of `size` encoded bytes.
    pub async fn route_data(
        &self,
        sender: ConnectionId,
        kind: DataKind,
        payload: Routed,
        size: usize,
    ) -> RouteOutcome {
        let received_at = unix_millis();

        // Admission happens under the state lock so a concurrent teardown
        // cannot leave accounting behind for a session that no longer exists.
        let (source_id, recipients, permit) = {
            let state = self.state.lock().await;
            let Some(source_id) = state.sender_as(sender, Role::Target) else {
                debug!(conn_id = sender, ?kind, "data event from non-target ignored");
                return RouteOutcome::Ignored;
            };
            let recipients =
                state.recipients(sender, payload.session_id.as_deref(), Role::Controller);

            let key = match &recipients.session_id {
                Some(session_id) => LinkKey::Session {
                    session_id: session_id.clone(),
                    direction: Direction::from_sender(Role::Target),
                },
                None => LinkKey::Connection {
                    role: Role::Target,
                    connection_id: sender,
                },
            };
            let Some(permit) = self.backpressure.admit_with_permit(&key, size).await else {
                return RouteOutcome::Dropped;
            };
            (source_id, recipients, permit)
        };

        let event = kind.forward(Forwarded::stamp(payload, source_id, received_at));
        let outbound = Outbound {
            event: Arc::new(event),
            permit: Some(Arc::new(permit)),
        };
        let delivered = deliver(&recipients.outboxes, &outbound);
        debug!(
            conn_id = sender,
            ?kind,
            size,
            session_id = recipients.session_id.as_deref().unwrap_or("-"),
            delivered,
            "data routed"
        );
        RouteOutcome::Delivered(delivered)
    }

    /// Live targets, for controllers only; anyone else gets an empty list.
    pub async fn list_targets(&self, requester: ConnectionId) -> Vec<TargetInfo> {
        let state = self.state.lock().await;
        if state.registry.role_of(requester) != Role::Controller {
            debug!(conn_id = requester, "target listing refused to non-controller");
            return Vec::new();
        }
        state
            .registry
            .list_by_role(Role::Target)
            .iter()
            .map(Connection::target_info)
            .collect()
    }
}
