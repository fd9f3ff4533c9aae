//! Client error types and exit-code mapping.

use thiserror::Error;

use relaybridge_protocol::ProtocolError;
use relaybridge_transport::TransportError;

/// Result type for client operations
pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Errors surfaced by the client
#[derive(Error, Debug)]
pub enum ClientError {
    /// Configuration could not be loaded or validated
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport-level failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Protocol-level failure
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The relay rejected the credentials; retrying cannot help
    #[error("authentication failed ({code}): {message}")]
    AuthFatal {
        /// Server error code
        code: String,
        /// Server-provided description
        message: String,
    },

    /// The supervisor gave up reconnecting
    #[error("max reconnect attempts reached")]
    RetriesExhausted,

    /// A tunnel request was rejected; the session stays valid
    #[error("tunnel request rejected: {0}")]
    TunnelRejected(String),

    /// No live session to carry the request
    #[error("not connected to the relay")]
    NotConnected,

    /// The peer did not answer within the request timeout
    #[error("request timed out")]
    Timeout,

    /// Metrics exporter failed to install or serve
    #[error("metrics exporter: {0}")]
    Metrics(String),

    /// Filesystem or socket error outside a transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for ClientError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl ClientError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::AuthFatal { .. } => 3,
            Self::RetriesExhausted => 4,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ClientError::Config("x".into()).exit_code(), 2);
        assert_eq!(
            ClientError::AuthFatal {
                code: "invalid_token".into(),
                message: "no".into()
            }
            .exit_code(),
            3
        );
        assert_eq!(ClientError::RetriesExhausted.exit_code(), 4);
        assert_eq!(ClientError::Timeout.exit_code(), 1);
    }
}
