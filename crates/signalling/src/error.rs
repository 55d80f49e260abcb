//! Signalling error types.

use crate::protocol::close_code;
use thiserror::Error;

/// Signalling error type.
#[derive(Debug, Error)]
pub enum SignallingError {
    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error (listener bind, accept).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The connection is closing; nothing more is written to it.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Channel send error.
    #[error("Channel send error")]
    ChannelSend,
}

impl From<tokio::sync::mpsc::error::SendError<axum::extract::ws::Message>> for SignallingError {
    fn from(_: tokio::sync::mpsc::error::SendError<axum::extract::ws::Message>) -> Self {
        SignallingError::ChannelSend
    }
}

/// Result type for signalling operations.
pub type Result<T> = std::result::Result<T, SignallingError>;

/// A frame that cannot be handled. Fatal to the connection it arrived on,
/// never to the process.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame is not valid JSON (or not UTF-8).
    #[error("cannot parse message: {0}")]
    Unparseable(String),

    /// The `type` field is missing or has no handler for this role.
    #[error("unsupported message type: {0}")]
    UnsupportedType(String),

    /// A message arrived on a player socket whose registry entry is gone.
    #[error("message from unregistered player {0}")]
    UnknownPlayer(String),
}

impl ProtocolError {
    /// WebSocket close code sent to the offending peer.
    pub fn close_code(&self) -> u16 {
        match self {
            ProtocolError::Unparseable(_) | ProtocolError::UnsupportedType(_) => {
                close_code::POLICY_VIOLATION
            }
            ProtocolError::UnknownPlayer(_) => close_code::GOING_AWAY,
        }
    }

    /// WebSocket close reason sent to the offending peer.
    pub fn close_reason(&self) -> &'static str {
        match self {
            ProtocolError::Unparseable(_) => "Cannot parse",
            ProtocolError::UnsupportedType(_) => "Unsupported message type",
            ProtocolError::UnknownPlayer(_) => "Broken",
        }
    }
}

/// A connection refused at accept time. No registry state is touched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CapacityError {
    /// Admitting the player would exceed the configured maximum.
    #[error("too many connections. max: {max}, current: {current}")]
    TooManyPlayers { max: i64, current: usize },

    /// An SFU is already registered.
    #[error("Already have an SFU")]
    SfuAlreadyConnected,
}

impl CapacityError {
    /// WebSocket close code sent to the rejected peer.
    pub fn close_code(&self) -> u16 {
        close_code::TRY_AGAIN_LATER
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_close_vocabulary() {
        let parse = ProtocolError::Unparseable("eof".to_string());
        assert_eq!(parse.close_code(), 1008);
        assert_eq!(parse.close_reason(), "Cannot parse");

        let unsupported = ProtocolError::UnsupportedType("bogus".to_string());
        assert_eq!(unsupported.close_code(), 1008);
        assert_eq!(unsupported.close_reason(), "Unsupported message type");

        assert_eq!(ProtocolError::UnknownPlayer("7".to_string()).close_code(), 1001);
    }

    #[test]
    fn test_capacity_error_reason() {
        let err = CapacityError::TooManyPlayers { max: 2, current: 2 };
        assert_eq!(err.close_code(), 1013);
        assert_eq!(err.to_string(), "too many connections. max: 2, current: 2");
        assert_eq!(CapacityError::SfuAlreadyConnected.to_string(), "Already have an SFU");
    }
}
