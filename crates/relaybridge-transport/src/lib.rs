//! # Relaybridge Transport
//!
//! Transport layer for the relaybridge client with runtime protocol
//! selection and fault tolerance.
//!
//! ## Supported Transports
//!
//! - **QUIC**: UDP + TLS 1.3, one bidirectional stream for control frames
//! - **HTTP/2**: TLS-required request/response carrier; refuses HTTP/1
//! - **TCP**: newline-delimited frames on a plain or TLS-wrapped socket,
//!   the canonical compatibility transport
//!
//! ## Reliability Features
//!
//! - **Protocol Selector**: per-transport success/failure/latency
//!   bookkeeping, policy-ordered selection, cooldown-gated migration
//! - **Circuit Breaker**: closed/half-open/open gating of outbound dials
//! - **Rate Limiter**: per-principal sliding window with exponential
//!   backoff and an idle-bucket janitor
//!
//! All transports speak whole control frames ([`bytes::Bytes`], terminator
//! excluded); framing itself lives in `relaybridge-protocol`.

pub mod breaker;
pub mod core;
pub mod http2;
pub mod quic;
pub mod rate_limit;
pub mod selector;
pub mod tcp;
pub mod tls;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use core::{
    Transport, TransportError, TransportFactory, TransportKind, TransportResult, TransportState,
};
pub use http2::Http2Transport;
pub use quic::{QuicOptions, QuicTransport};
pub use rate_limit::{Admission, RateLimitConfig, RateLimiter};
pub use selector::{ProtocolSelector, TransportPolicy, TransportStats};
pub use tcp::TcpTransport;
pub use tls::TlsOptions;
