//! Error Types
//!
//! Typed failures of the relay core. Application edges (config loading,
//! binaries) wrap these in `anyhow` with context.

use thiserror::Error;
use tokio_util::codec::LinesCodecError;

use crate::connection::ConnectionId;

/// Errors raised by the registry, relay and session handlers
#[derive(Error, Debug)]
pub enum RelayError {
    /// No usable display name was received
    #[error("Handshake failed: {0}")]
    HandshakeFailure(String),

    /// A write to one recipient failed; never fatal for the sender
    #[error("Delivery to {id} failed: {reason}")]
    DeliveryFailure { id: ConnectionId, reason: String },

    /// Reading the next message unit failed
    #[error("Read failed: {0}")]
    ReadFailure(String),

    /// The peer closed its side of the stream
    #[error("Stream closed by peer")]
    StreamClosed,

    /// Register was called twice for the same identity
    #[error("Connection {0} is already registered")]
    DuplicateIdentity(ConnectionId),

    /// The display name of a connection is assigned exactly once
    #[error("Display name already assigned for {0}")]
    NameAlreadySet(ConnectionId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LinesCodecError> for RelayError {
    fn from(err: LinesCodecError) -> Self {
        match err {
            LinesCodecError::MaxLineLengthExceeded => {
                RelayError::ReadFailure("message exceeds maximum line length".to_string())
            }
            LinesCodecError::Io(e) => RelayError::ReadFailure(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_error_maps_to_read_failure() {
        let err: RelayError = LinesCodecError::MaxLineLengthExceeded.into();
        assert!(matches!(err, RelayError::ReadFailure(_)));
    }

    #[test]
    fn test_duplicate_identity_display() {
        let err = RelayError::DuplicateIdentity(ConnectionId::new(7));
        assert_eq!(err.to_string(), "Connection conn_7 is already registered");
    }
}
