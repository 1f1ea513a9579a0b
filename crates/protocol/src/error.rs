//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering envelope and payload failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize an envelope.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize an envelope.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// The envelope was well formed but its payload does not match the event.
    #[error("invalid payload for {event}: {reason}")]
    InvalidPayload {
        /// Event name the payload was sent with.
        event: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Terminal geometry outside the accepted range.
    #[error("invalid terminal size {cols}x{rows}: each side must be between 1 and {max}")]
    InvalidSize {
        /// Requested columns.
        cols: u16,
        /// Requested rows.
        rows: u16,
        /// Largest accepted value for either side.
        max: u16,
    },

    /// The event name is not part of the protocol.
    #[error("unknown event: {0}")]
    UnknownEvent(String),

    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}
