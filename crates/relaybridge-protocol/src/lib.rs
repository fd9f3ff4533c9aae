//! # Relaybridge Protocol
//!
//! Control-plane protocol for the relaybridge tunnel client: the
//! line-delimited JSON message catalogue, frame codec, version negotiation,
//! and the client-side handshake state machine.
//!
//! The wire format is one UTF-8 JSON object per line, terminated by `\n`,
//! at most 1 MiB per frame, no compression. Every message carries a `type`
//! field selecting its variant.
//!
//! This crate is transport-agnostic: it never touches a socket. Transports
//! move opaque frames; the [`codec`] module splits and joins them, and the
//! [`handshake`] module interprets them until a session is established.

pub mod codec;
pub mod error;
pub mod handshake;
pub mod messages;

pub use codec::{FrameCodec, MAX_FRAME_SIZE, decode_message, encode_message};
pub use error::{ErrorClass, ProtocolError, classify_code};
pub use handshake::{Handshake, HandshakeConfig, Negotiated, SessionState, Step};
pub use messages::{
    Auth, AuthResponse, ClientInfo, ControlMessage, ErrorMessage, Hello, ProtocolVersion,
    TunnelInfo, TunnelResponse,
};

/// Result type for protocol operations
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;
