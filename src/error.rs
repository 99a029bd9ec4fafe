//! Error taxonomy for the bus connector.
//!
//! Errors on the request path (publish, subscribe, connect) are returned to
//! the caller. Errors discovered asynchronously (broker pushes, background
//! reconnects) are raised through [`crate::events`] instead.

use std::time::Duration;

use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::discovery::TopologyParseError;

/// Result type for connector operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur while talking to the broker.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// An operation was attempted before `connect` succeeded (or after `close`).
    #[error("Redis connection not started")]
    NotConnected,

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Discovery failed: {0}")]
    Discovery(String),

    #[error("Script evaluation failed: {0}")]
    Script(String),

    /// Error reply pushed by the server outside of any request.
    #[error("Redis server error: {0}")]
    Server(String),

    #[error("Malformed topology change notification: {0}")]
    TopologyParse(#[from] TopologyParseError),

    #[error("Key '{key}' did not become reachable within {waited:?}")]
    RecoveryTimeout { key: String, waited: Duration },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Message decode failed: {0}")]
    Decode(#[from] CodecError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_connected_message() {
        assert_eq!(
            BusError::NotConnected.to_string(),
            "Redis connection not started"
        );
    }

    #[test]
    fn test_from_codec_error() {
        let err: BusError = CodecError::MissingSeparator.into();
        assert!(matches!(err, BusError::Decode(CodecError::MissingSeparator)));
    }
}
