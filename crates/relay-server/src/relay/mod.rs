//! Controller/target relay: registry, routing and admission control.
//!
//! [`Relay`] is the façade the transport talks to. The registry and the
//! session manager live together behind one mutex so that every mutation
//! for a connection id is serialized; pairing and role events are rare next
//! to frame traffic, so a single coarse lock is enough. Frame admission runs
//! on per-link atomics in [`backpressure`].

pub mod backpressure;
pub mod lifecycle;
pub mod registry;
pub mod router;

pub use backpressure::{BackpressureController, FramePermit};
pub use registry::ConnectionRegistry;

use crate::session::{Session, SessionManager};
use relay_core::{unix_millis, ClientEvent, ConnectionId, PerformanceReport, Role, ServerEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// A message queued for one connection's writer.
///
/// Data-class frames carry the admission permit of their link; it is
/// released once every recipient's writer has dropped its copy.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub event: Arc<ServerEvent>,
    /// Held only so its `Drop` frees the link slot.
    #[allow(dead_code)]
    pub permit: Option<Arc<FramePermit>>,
}

impl Outbound {
    pub fn new(event: ServerEvent) -> Self {
        Self {
            event: Arc::new(event),
            permit: None,
        }
    }
}

/// Sender half of a connection's outbound queue.
pub type Outbox = mpsc::Sender<Outbound>;

/// State guarded by the relay mutex.
#[derive(Debug, Default)]
pub(crate) struct RelayState {
    pub registry: ConnectionRegistry,
    pub sessions: SessionManager,
}

impl RelayState {
    /// Tell the surviving side of each ended session that it is gone.
    fn notify_session_end(&self, ended: &[Session], departing: ConnectionId, reason: &str) {
        for session in ended {
            let Some(peer) = session.peer_of(departing) else {
                continue;
            };
            if let Some(conn) = self.registry.get(peer) {
                let event = ServerEvent::SessionEnded {
                    session_id: session.id.clone(),
                    reason: reason.to_string(),
                };
                if conn.outbox.try_send(Outbound::new(event)).is_err() {
                    debug!(conn_id = peer, session_id = %session.id, "session_ended not delivered");
                }
            }
        }
    }
}

/// Historical totals; never decremented.
#[derive(Debug, Default)]
struct LifetimeCounters {
    connections: AtomicU64,
    controllers_joined: AtomicU64,
    targets_joined: AtomicU64,
}

/// The relay instance shared by all connection tasks.
pub struct Relay {
    state: Mutex<RelayState>,
    backpressure: BackpressureController,
    counters: LifetimeCounters,
    next_conn_id: AtomicU64,
}

impl Relay {
    /// Create a relay whose links tolerate `max_pending` outstanding frames.
    pub fn new(max_pending: usize, drop_log_every: u64) -> Self {
        Self {
            state: Mutex::new(RelayState::default()),
            backpressure: BackpressureController::new(max_pending, drop_log_every),
            counters: LifetimeCounters::default(),
            next_conn_id: AtomicU64::new(1),
        }
    }

    #[cfg(test)]
    pub fn backpressure(&self) -> &BackpressureController {
        &self.backpressure
    }

    /// Dispatch one decoded inbound event.
    ///
    /// Returns the direct reply for the sender, if the event has one.
    /// `frame_len` is the encoded size of the inbound frame, used for
    /// throughput accounting.
    pub async fn handle_event(
        &self,
        conn_id: ConnectionId,
        event: ClientEvent,
        frame_len: usize,
    ) -> Option<ServerEvent> {
        let name = event.name();
        match event {
            ClientEvent::JoinAsController { controller_id } => {
                self.join_or_log(conn_id, Role::Controller, controller_id)
                    .await
            }
            ClientEvent::JoinAsTarget { target_id } => {
                self.join_or_log(conn_id, Role::Target, target_id).await
            }
            ClientEvent::PairWithTarget { target_id } => {
                let target_id = target_id.trim().to_string();
                Some(match self.pair(conn_id, &target_id).await {
                    Ok(session_id) => ServerEvent::PairingSuccess {
                        target_id,
                        session_id,
                    },
                    Err(e) => ServerEvent::PairingFailed {
                        error: e.to_string(),
                    },
                })
            }
            ClientEvent::GetTargets => Some(ServerEvent::TargetsList {
                targets: self.list_targets(conn_id).await,
            }),
            ClientEvent::GetStats => Some(ServerEvent::Stats(self.performance_report().await)),
            ClientEvent::Ping => Some(ServerEvent::Pong {
                server_timestamp: unix_millis(),
            }),

            ClientEvent::ControlEvent(p) => {
                self.route_control(conn_id, router::ControlKind::ControlEvent, p)
                    .await
                    .log_unrouted(conn_id, name);
                None
            }
            ClientEvent::TerminalCommand(p) => {
                self.route_control(conn_id, router::ControlKind::TerminalCommand, p)
                    .await
                    .log_unrouted(conn_id, name);
                None
            }
            ClientEvent::ScreenshotRequest(p) => {
                self.route_control(conn_id, router::ControlKind::ScreenshotRequest, p)
                    .await
                    .log_unrouted(conn_id, name);
                None
            }

            ClientEvent::ScreenData(p) => {
                self.route_data(conn_id, router::DataKind::ScreenData, p, frame_len)
                    .await
                    .log_unrouted(conn_id, name);
                None
            }
            ClientEvent::ScreenshotData(p) => {
                self.route_data(conn_id, router::DataKind::ScreenshotData, p, frame_len)
                    .await
                    .log_unrouted(conn_id, name);
                None
            }
            ClientEvent::TerminalOutput(p) => {
                self.route_data(conn_id, router::DataKind::TerminalOutput, p, frame_len)
                    .await
                    .log_unrouted(conn_id, name);
                None
            }
        }
    }

    async fn join_or_log(
        &self,
        conn_id: ConnectionId,
        role: Role,
        external_id: String,
    ) -> Option<ServerEvent> {
        match self.join(conn_id, role, external_id).await {
            Ok(reply) => Some(reply),
            Err(e) => {
                debug!(conn_id, %role, error = %e, "join ignored");
                None
            }
        }
    }

    /// Aggregate statistics across all links and connections.
    pub async fn performance_report(&self) -> PerformanceReport {
        let totals = self.backpressure.totals();
        let state = self.state.lock().await;
        PerformanceReport {
            uptime: totals.uptime_secs,
            frames_processed: totals.frames_processed,
            frames_per_second: totals.frames_per_second,
            average_frame_size_bytes: totals.average_frame_size,
            total_bytes_transferred: totals.total_bytes,
            frames_dropped: totals.frames_dropped,
            active_sessions: state.sessions.count(),
            connected_controllers: state.registry.count_by_role(Role::Controller),
            connected_targets: state.registry.count_by_role(Role::Target),
            total_connections: self.counters.connections.load(Ordering::Relaxed),
            total_controllers_joined: self.counters.controllers_joined.load(Ordering::Relaxed),
            total_targets_joined: self.counters.targets_joined.load(Ordering::Relaxed),
        }
    }
}

/// Hand `outbound` to every outbox without waiting.
///
/// Full or closed queues are skipped; returns how many accepted the message.
fn deliver(outboxes: &[Outbox], outbound: &Outbound) -> usize {
    outboxes
        .iter()
        .filter(|tx| match tx.try_send(outbound.clone()) {
            Ok(()) => true,
            Err(e) => {
                debug!(event = outbound.event.name(), error = %e, "delivery skipped");
                false
            }
        })
        .count()
}
