//! Core transport trait and shared types.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use relaybridge_protocol::ProtocolError;

use crate::http2::Http2Transport;
use crate::quic::{QuicOptions, QuicTransport};
use crate::tcp::TcpTransport;
use crate::tls::TlsOptions;

/// Result type for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Errors that can occur in transport operations
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Dial failed
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// TLS configuration or handshake failed
    #[error("TLS error: {0}")]
    Tls(String),

    /// Send operation failed
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive operation failed
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Peer violated the transport contract
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Frame-level error from the codec
    #[error("framing error: {0}")]
    Frame(String),

    /// Operation exceeded its deadline
    #[error("operation timed out")]
    Timeout,

    /// Operation was cancelled from outside
    #[error("operation cancelled")]
    Cancelled,

    /// Circuit breaker rejected the call without dialling
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// Transport is not connected
    #[error("transport not connected")]
    NotConnected,

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl TransportError {
    /// Short label for metrics, one per error kind
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::ConnectFailed(_) => "connect",
            Self::Tls(_) => "tls",
            Self::SendFailed(_) => "send",
            Self::ReceiveFailed(_) => "receive",
            Self::Protocol(_) => "protocol",
            Self::Frame(_) => "frame",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::CircuitOpen => "circuit_open",
            Self::NotConnected => "not_connected",
            Self::Configuration(_) => "configuration",
        }
    }

    /// Whether this error is a cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<ProtocolError> for TransportError {
    fn from(err: ProtocolError) -> Self {
        Self::Frame(err.to_string())
    }
}

/// Transports the client can speak, in default preference order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// QUIC datagram/stream transport
    Quic,
    /// HTTP/2 request/response transport over TLS
    Http2,
    /// Line-delimited TCP, optionally TLS-wrapped
    Http1,
}

impl TransportKind {
    /// All kinds in default preference order
    pub const ALL: [Self; 3] = [Self::Quic, Self::Http2, Self::Http1];

    /// Metrics label for this kind
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Quic => "quic",
            Self::Http2 => "http2",
            Self::Http1 => "http1",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport state information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportState {
    /// Transport is disconnected
    Disconnected,
    /// Transport is connecting
    Connecting,
    /// Transport is connected and ready
    Connected,
    /// Transport has failed
    Failed {
        /// Failure reason description
        reason: String,
    },
}

/// Core transport trait.
///
/// A transport moves whole control frames; framing and interpretation live
/// in `relaybridge-protocol`. `connect` honours the supplied cancellation
/// token; callers cancel `send`/`recv` by dropping the future and then
/// calling `close`, which releases the underlying socket and TLS state.
#[async_trait]
pub trait Transport: Send + fmt::Debug {
    /// Which protocol this transport speaks
    fn kind(&self) -> TransportKind;

    /// Human-readable endpoint description
    fn endpoint(&self) -> String;

    /// Dial the relay. Must complete, fail, or be cancelled within `deadline`.
    async fn connect(
        &mut self,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> TransportResult<()>;

    /// Write one control frame (terminator excluded)
    async fn send(&mut self, frame: Bytes) -> TransportResult<()>;

    /// Read the next control frame in arrival order
    async fn recv(&mut self) -> TransportResult<Bytes>;

    /// Probe liveness, returning an RTT estimate
    async fn ping(&mut self) -> TransportResult<Duration>;

    /// Close the transport and release its resources
    async fn close(&mut self) -> TransportResult<()>;

    /// Current state
    fn state(&self) -> TransportState;

    /// Whether the transport is connected
    fn is_connected(&self) -> bool {
        matches!(self.state(), TransportState::Connected)
    }
}

/// Builds transport instances for a fixed relay endpoint.
///
/// The factory owns everything needed to dial: address, TLS material, and
/// per-protocol tuning. The supervisor asks the selector for a kind and the
/// factory for an instance of it; transport instances themselves are owned
/// by whoever dialled them.
#[derive(Debug, Clone)]
pub struct TransportFactory {
    host: String,
    port: u16,
    tls: TlsOptions,
    quic: QuicOptions,
}

impl TransportFactory {
    /// Create a factory for the given relay endpoint
    pub fn new(host: impl Into<String>, port: u16, tls: TlsOptions) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
            quic: QuicOptions::default(),
        }
    }

    /// Override QUIC tuning
    #[must_use]
    pub fn with_quic_options(mut self, quic: QuicOptions) -> Self {
        self.quic = quic;
        self
    }

    /// Relay host
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Relay port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Build a disconnected transport of the given kind.
    ///
    /// TLS material is loaded lazily at `connect` time so that a bad bundle
    /// path surfaces as a connect failure, which the supervisor retries.
    pub fn build(&self, kind: TransportKind) -> TransportResult<Box<dyn Transport>> {
        match kind {
            TransportKind::Quic => Ok(Box::new(QuicTransport::new(
                &self.host,
                self.port,
                &self.tls,
                self.quic.clone(),
            ))),
            TransportKind::Http2 => Ok(Box::new(Http2Transport::new(
                &self.host,
                self.port,
                &self.tls,
            ))),
            TransportKind::Http1 => Ok(Box::new(TcpTransport::new(
                &self.host,
                self.port,
                &self.tls,
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels() {
        assert_eq!(TransportKind::Quic.as_str(), "quic");
        assert_eq!(TransportKind::Http2.as_str(), "http2");
        assert_eq!(TransportKind::Http1.as_str(), "http1");
    }

    #[test]
    fn test_kind_serde_round_trip() {
        let json = serde_json::to_string(&TransportKind::Http2).unwrap();
        assert_eq!(json, r#""http2""#);
        let parsed: TransportKind = serde_json::from_str(r#""quic""#).unwrap();
        assert_eq!(parsed, TransportKind::Quic);
    }

    #[test]
    fn test_error_kind_labels() {
        assert_eq!(
            TransportError::ConnectFailed("x".into()).kind_label(),
            "connect"
        );
        assert_eq!(TransportError::Timeout.kind_label(), "timeout");
        assert!(TransportError::Cancelled.is_cancelled());
        assert!(!TransportError::Timeout.is_cancelled());
    }

    #[test]
    fn test_factory_builds_every_kind() {
        let factory = TransportFactory::new("relay.example.com", 8443, TlsOptions::disabled());
        for kind in TransportKind::ALL {
            let transport = factory.build(kind).expect("build transport");
            assert_eq!(transport.kind(), kind);
            assert!(!transport.is_connected());
        }
    }
}
