//! Protocol error types and server error-code classification.

use std::time::Duration;

use thiserror::Error;

/// Errors produced while framing or interpreting control messages
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    /// Frame exceeded the 1 MiB limit
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    Oversize(usize),

    /// Frame was not a valid UTF-8 JSON object
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Server advertised a version this client cannot speak
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(String),

    /// Message arrived in a state that does not accept it
    #[error("unexpected {message} message in state {state}")]
    UnexpectedMessage {
        /// Message type received
        message: String,
        /// Handshake state at the time
        state: String,
    },

    /// Server sent an `error` frame
    #[error("server error {code}: {message}")]
    Server {
        /// Machine-readable error code
        code: String,
        /// Human-readable description
        message: String,
        /// Server-provided retry hint, if any
        retry_after: Option<Duration>,
    },

    /// Underlying stream I/O failed while framing
    #[error("frame I/O error: {0}")]
    Io(String),

    /// The session is closed and accepts no further messages
    #[error("session closed")]
    Closed,
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl ProtocolError {
    /// Classification of a server error carried by this value, if it is one
    pub fn server_class(&self) -> Option<ErrorClass> {
        match self {
            Self::Server { code, .. } => Some(classify_code(code)),
            _ => None,
        }
    }
}

/// How a server error code must be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Non-retryable for this principal; the client must stop
    Fatal,
    /// Retryable after the server's `retry_after` hint
    RetryableWithHint,
    /// Retryable with ordinary backoff
    Retryable,
    /// The tunnel request is rejected; the session stays valid
    TunnelRejected,
    /// Log and continue
    Advisory,
}

/// Classify a server error code into a handling class.
///
/// Codes outside the catalogue are treated as retryable: an unknown code is
/// more likely a new transient condition than a new fatal one, and a fatal
/// misclassification would strand the client.
pub fn classify_code(code: &str) -> ErrorClass {
    match code {
        "invalid_token" | "token_expired" => ErrorClass::Fatal,
        "rate_limit_exceeded" => ErrorClass::RetryableWithHint,
        "connection_limit_reached" | "server_unavailable" => ErrorClass::Retryable,
        "invalid_tunnel_info" => ErrorClass::TunnelRejected,
        "unknown_message_type" => ErrorClass::Advisory,
        _ => ErrorClass::Retryable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_known_codes() {
        assert_eq!(classify_code("invalid_token"), ErrorClass::Fatal);
        assert_eq!(classify_code("token_expired"), ErrorClass::Fatal);
        assert_eq!(
            classify_code("rate_limit_exceeded"),
            ErrorClass::RetryableWithHint
        );
        assert_eq!(
            classify_code("connection_limit_reached"),
            ErrorClass::Retryable
        );
        assert_eq!(classify_code("server_unavailable"), ErrorClass::Retryable);
        assert_eq!(
            classify_code("invalid_tunnel_info"),
            ErrorClass::TunnelRejected
        );
        assert_eq!(classify_code("unknown_message_type"), ErrorClass::Advisory);
    }

    #[test]
    fn test_classify_unknown_code_is_retryable() {
        assert_eq!(classify_code("quota_exceeded_v2"), ErrorClass::Retryable);
    }

    #[test]
    fn test_server_class_accessor() {
        let err = ProtocolError::Server {
            code: "invalid_token".to_string(),
            message: "bad token".to_string(),
            retry_after: None,
        };
        assert_eq!(err.server_class(), Some(ErrorClass::Fatal));
        assert_eq!(ProtocolError::Closed.server_class(), None);
    }
}
