use thiserror::Error;

/// Errors produced by the relay protocol layer.
///
/// Only `PeerNotFound` is ever reported to a client. `NotAuthorized` and
/// `Overloaded` describe routed events that were ignored or shed; they end
/// up in the relay's logs, never on the wire.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("not authorized for action: {0}")]
    NotAuthorized(String),

    #[error("overloaded: {0}")]
    Overloaded(String),

    #[error("unknown connection: {0}")]
    UnknownConnection(u64),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Codec(e.to_string())
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
