//! Relay event vocabulary.
//!
//! Every frame on the wire is `{"event": "<name>", "data": {...}}`. Inbound
//! and outbound events are closed enums; anything that does not match a
//! variant is rejected by the codec.

use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Deserializer, Serialize};

/// Transport-assigned connection identifier.
pub type ConnectionId = u64;

/// Opaque client payload fields, relayed untouched.
pub type Body = serde_json::Map<String, serde_json::Value>;

/// Longest accepted `controller_id` / `target_id`, in bytes.
pub const MAX_EXTERNAL_ID_LEN: usize = 128;

/// Body key carrying the relay's receive time on forwarded payloads.
pub const SERVER_TIMESTAMP_KEY: &str = "server_timestamp";

/// Body key carrying the sender's external id on forwarded payloads.
pub const SOURCE_ID_KEY: &str = "source_id";

/// Declared role of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Unassigned,
    Controller,
    Target,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Unassigned => "unassigned",
            Role::Controller => "controller",
            Role::Target => "target",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A routable payload: optional session hint plus opaque fields.
///
/// A missing or `null` payload reads as an empty one, so bare events such
/// as `screenshot_request` still route.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Routed {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub body: Body,
}

#[derive(Deserialize)]
struct RoutedFields {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(flatten)]
    body: Body,
}

impl<'de> Deserialize<'de> for Routed {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let fields = Option::<RoutedFields>::deserialize(deserializer)?;
        Ok(fields
            .map(|f| Routed {
                session_id: f.session_id,
                body: f.body,
            })
            .unwrap_or_default())
    }
}

/// A payload as delivered to the receiving peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forwarded {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Unix milliseconds at which the relay received the payload.
    pub server_timestamp: u64,
    /// External id of the sending peer, if it declared one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(flatten)]
    pub body: Body,
}

impl Forwarded {
    /// Wrap a routed payload with the relay's receive time.
    ///
    /// `server_timestamp` always carries the relay's clock. `source_id` is
    /// only added when the body does not already hold one, so client fields
    /// pass through untouched.
    pub fn stamp(routed: Routed, source_id: Option<String>, server_timestamp: u64) -> Self {
        let Routed { session_id, mut body } = routed;
        body.remove(SERVER_TIMESTAMP_KEY);
        let source_id = source_id.filter(|_| !body.contains_key(SOURCE_ID_KEY));
        Self {
            session_id,
            server_timestamp,
            source_id,
            body,
        }
    }
}

/// Events a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinAsController { controller_id: String },
    JoinAsTarget { target_id: String },
    PairWithTarget { target_id: String },
    GetTargets,
    GetStats,
    Ping,

    // controller -> target
    ControlEvent(Routed),
    TerminalCommand(Routed),
    ScreenshotRequest(Routed),

    // target -> controller
    ScreenData(Routed),
    ScreenshotData(Routed),
    TerminalOutput(Routed),
}

impl ClientEvent {
    /// Wire name of the event, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinAsController { .. } => "join_as_controller",
            ClientEvent::JoinAsTarget { .. } => "join_as_target",
            ClientEvent::PairWithTarget { .. } => "pair_with_target",
            ClientEvent::GetTargets => "get_targets",
            ClientEvent::GetStats => "get_stats",
            ClientEvent::Ping => "ping",
            ClientEvent::ControlEvent(_) => "control_event",
            ClientEvent::TerminalCommand(_) => "terminal_command",
            ClientEvent::ScreenshotRequest(_) => "screenshot_request",
            ClientEvent::ScreenData(_) => "screen_data",
            ClientEvent::ScreenshotData(_) => "screenshot_data",
            ClientEvent::TerminalOutput(_) => "terminal_output",
        }
    }

    /// Check the payload shape beyond what deserialization enforces.
    pub fn validate(&self) -> RelayResult<()> {
        match self {
            ClientEvent::JoinAsController { controller_id } => {
                validate_external_id("controller_id", controller_id)
            }
            ClientEvent::JoinAsTarget { target_id } | ClientEvent::PairWithTarget { target_id } => {
                validate_external_id("target_id", target_id)
            }
            _ => Ok(()),
        }
    }
}

fn validate_external_id(field: &str, value: &str) -> RelayResult<()> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(RelayError::InvalidMessage(format!("{field} is empty")));
    }
    if trimmed.len() > MAX_EXTERNAL_ID_LEN {
        return Err(RelayError::InvalidMessage(format!(
            "{field} too long: {} bytes (max {MAX_EXTERNAL_ID_LEN})",
            trimmed.len()
        )));
    }
    Ok(())
}

/// One entry of a `targets_list` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetInfo {
    pub target_id: String,
    pub address: String,
    /// Unix milliseconds of the target's join.
    pub joined_at: u64,
}

/// Aggregate relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceReport {
    /// Seconds since the relay started.
    pub uptime: f64,
    pub frames_processed: u64,
    pub frames_per_second: f64,
    pub average_frame_size_bytes: f64,
    pub total_bytes_transferred: u64,
    pub frames_dropped: u64,
    pub active_sessions: usize,
    pub connected_controllers: usize,
    pub connected_targets: usize,
    pub total_connections: u64,
    pub total_controllers_joined: u64,
    pub total_targets_joined: u64,
}

/// Events the relay sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Registered { role: Role, id: String },
    PairingSuccess { target_id: String, session_id: String },
    PairingFailed { error: String },
    ControllerPaired { controller_id: String, session_id: String },
    SessionEnded { session_id: String, reason: String },
    TargetsList { targets: Vec<TargetInfo> },
    Stats(PerformanceReport),
    Pong { server_timestamp: u64 },

    // controller -> target
    ControlCommand(Forwarded),
    ExecuteTerminal(Forwarded),
    TakeScreenshot(Forwarded),

    // target -> controller
    ScreenUpdate(Forwarded),
    ScreenshotResponse(Forwarded),
    TerminalResponse(Forwarded),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Registered { .. } => "registered",
            ServerEvent::PairingSuccess { .. } => "pairing_success",
            ServerEvent::PairingFailed { .. } => "pairing_failed",
            ServerEvent::ControllerPaired { .. } => "controller_paired",
            ServerEvent::SessionEnded { .. } => "session_ended",
            ServerEvent::TargetsList { .. } => "targets_list",
            ServerEvent::Stats(_) => "stats",
            ServerEvent::Pong { .. } => "pong",
            ServerEvent::ControlCommand(_) => "control_command",
            ServerEvent::ExecuteTerminal(_) => "execute_terminal",
            ServerEvent::TakeScreenshot(_) => "take_screenshot",
            ServerEvent::ScreenUpdate(_) => "screen_update",
            ServerEvent::ScreenshotResponse(_) => "screenshot_response",
            ServerEvent::TerminalResponse(_) => "terminal_response",
        }
    }
}
