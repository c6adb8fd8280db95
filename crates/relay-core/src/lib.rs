//! relay-core: shared protocol library for the screen relay.
//!
//! Provides the closed event vocabulary exchanged between controllers,
//! targets and the relay, the JSON frame codec, and the error taxonomy.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode, encode};
pub use error::{RelayError, RelayResult};
pub use messages::{
    Body, ClientEvent, ConnectionId, Forwarded, PerformanceReport, Role, Routed, ServerEvent,
    TargetInfo,
};

/// Current wall-clock time as unix milliseconds.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
