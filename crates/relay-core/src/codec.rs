//! JSON codec for relay frames.
//!
//! One WebSocket message carries exactly one event, so there is no length
//! prefix: the transport's own message boundaries delimit frames.

use crate::error::{RelayError, RelayResult};
use crate::messages::{ClientEvent, ServerEvent};

/// Encode an outbound event into a JSON text frame.
pub fn encode(event: &ServerEvent) -> RelayResult<String> {
    Ok(serde_json::to_string(event)?)
}

/// Decode and validate an inbound frame.
///
/// Unknown event names, missing payloads and malformed fields are all
/// rejected here, so nothing unrecognized reaches the router.
pub fn decode(data: &[u8]) -> RelayResult<ClientEvent> {
    let event: ClientEvent = serde_json::from_slice(data)
        .map_err(|e| RelayError::InvalidMessage(format!("undecodable event: {e}")))?;
    event.validate()?;
    Ok(event)
}
