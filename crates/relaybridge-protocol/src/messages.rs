//! Control message catalogue and version profiles.
//!
//! Messages are internally tagged by a `type` field. Unknown fields are
//! tolerated on decode for forward compatibility; unknown `type` values
//! decode to [`ControlMessage::Unknown`] so a session can log and continue.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Negotiable protocol versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    /// Legacy profile, wire string `1.0.0`
    V1,
    /// Multi-tenant profile, wire string `2.0`
    V2,
}

impl ProtocolVersion {
    /// Canonical wire string for this version
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::V1 => "1.0.0",
            Self::V2 => "2.0",
        }
    }

    /// Parse a wire version string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1.0.0" => Some(Self::V1),
            "2.0" => Some(Self::V2),
            _ => None,
        }
    }

    /// Feature set advertised by default for this version profile
    pub const fn default_features(self) -> &'static [&'static str] {
        match self {
            Self::V1 => &["tls", "jwt", "tunneling", "quic", "http2"],
            Self::V2 => &[
                "tls",
                "heartbeat",
                "tunnel_info",
                "multi_tenant",
                "proxy",
                "quic",
                "metrics",
            ],
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client platform description sent in v1 `auth`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Operating system name
    pub os: String,
    /// CPU architecture
    pub arch: String,
    /// Client version
    pub version: String,
}

impl ClientInfo {
    /// Describe the running client from build-time constants
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Opening exchange, sent by both peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    /// Protocol version the sender speaks
    pub version: String,
    /// Features the sender supports
    #[serde(default)]
    pub features: Vec<String>,
}

/// Client credentials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Auth {
    /// Bearer token
    pub token: String,
    /// Tenant identity (v2 multi-tenant mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Protocol version echo (v1 only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Client platform description (v1 only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_info: Option<ClientInfo>,
}

/// Server verdict on an `auth`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthResponse {
    /// `"ok"` or `"success"` on success
    pub status: String,
    /// Server-assigned client identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Server-assigned session identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Granted permissions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
    /// Account limits
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub limits: Map<String, Value>,
}

impl AuthResponse {
    /// Whether the server accepted the credentials
    pub fn is_success(&self) -> bool {
        self.status == "ok" || self.status == "success"
    }
}

/// Tunnel declaration sent on a live session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelInfo {
    /// Client-proposed tunnel identity
    pub tunnel_id: String,
    /// Local listening port
    pub local_port: u16,
    /// Remote endpoint host
    pub remote_host: String,
    /// Remote endpoint port
    pub remote_port: u16,
    /// Payload protocol, `tcp` when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Transport-specific options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Map<String, Value>>,
}

/// Server verdict on a `tunnel_info`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelResponse {
    /// `"ok"` on success
    pub status: String,
    /// Server-assigned tunnel identity
    pub tunnel_id: String,
    /// Relay-side public port, if allocated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_port: Option<u16>,
    /// Relay-side endpoint, if allocated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl TunnelResponse {
    /// Whether the server created the tunnel
    pub fn is_success(&self) -> bool {
        self.status == "ok" || self.status == "success"
    }
}

/// Fatal or advisory error from the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Machine-readable code, see [`crate::error::classify_code`]
    pub code: String,
    /// Human-readable description
    pub message: String,
    /// Structured context, may carry a `retry_after` hint in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
}

impl ErrorMessage {
    /// Extract the server's `retry_after` hint, if present
    pub fn retry_after(&self) -> Option<Duration> {
        self.details
            .as_ref()
            .and_then(|d| d.get("retry_after"))
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
    }
}

/// One control frame, tagged by its `type` field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Version and feature advertisement
    Hello(Hello),
    /// Client credentials
    Auth(Auth),
    /// Server verdict on `auth`
    AuthResponse(AuthResponse),
    /// Tunnel declaration
    TunnelInfo(TunnelInfo),
    /// Server verdict on `tunnel_info`
    TunnelResponse(TunnelResponse),
    /// Session liveness probe
    Heartbeat,
    /// Liveness acknowledgement
    HeartbeatResponse,
    /// Server-reported error
    Error(ErrorMessage),
    /// Unrecognised `type`; logged and skipped
    #[serde(other)]
    Unknown,
}

impl ControlMessage {
    /// Wire name of this message's type
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::Auth(_) => "auth",
            Self::AuthResponse(_) => "auth_response",
            Self::TunnelInfo(_) => "tunnel_info",
            Self::TunnelResponse(_) => "tunnel_response",
            Self::Heartbeat => "heartbeat",
            Self::HeartbeatResponse => "heartbeat_response",
            Self::Error(_) => "error",
            Self::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_hello_round_trip() {
        let msg = ControlMessage::Hello(Hello {
            version: "2.0".to_string(),
            features: vec!["tls".to_string(), "heartbeat".to_string()],
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"hello""#));
        assert_eq!(serde_json::from_str::<ControlMessage>(&json).unwrap(), msg);
    }

    #[test]
    fn test_heartbeat_is_bare_type() {
        let json = serde_json::to_string(&ControlMessage::Heartbeat).unwrap();
        assert_eq!(json, r#"{"type":"heartbeat"}"#);
        let parsed: ControlMessage = serde_json::from_str(r#"{"type":"heartbeat_response"}"#).unwrap();
        assert_eq!(parsed, ControlMessage::HeartbeatResponse);
    }

    #[test]
    fn test_v1_auth_omits_tenant() {
        let msg = ControlMessage::Auth(Auth {
            token: "t".to_string(),
            tenant_id: None,
            version: Some("1.0.0".to_string()),
            client_info: Some(ClientInfo::current()),
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("tenant_id"));
        assert!(json.contains("client_info"));
    }

    #[test]
    fn test_unknown_fields_tolerated() {
        let json = r#"{"type":"auth_response","status":"ok","client_id":"c42","shiny_new_field":true}"#;
        let parsed: ControlMessage = serde_json::from_str(json).unwrap();
        match parsed {
            ControlMessage::AuthResponse(r) => {
                assert!(r.is_success());
                assert_eq!(r.client_id.as_deref(), Some("c42"));
            }
            other => panic!("expected auth_response, got {}", other.type_name()),
        }
    }

    #[test]
    fn test_unknown_type_decodes() {
        let parsed: ControlMessage =
            serde_json::from_str(r#"{"type":"proxy_open","target":"db"}"#).unwrap();
        assert_eq!(parsed, ControlMessage::Unknown);
    }

    #[test]
    fn test_missing_required_field_rejected() {
        // auth without a token must not parse
        let result = serde_json::from_str::<ControlMessage>(r#"{"type":"auth"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_auth_status_success_alias() {
        let r: AuthResponse =
            serde_json::from_str(r#"{"status":"success","session_id":"s7"}"#).unwrap();
        assert!(r.is_success());
        let r: AuthResponse = serde_json::from_str(r#"{"status":"denied"}"#).unwrap();
        assert!(!r.is_success());
    }

    #[test]
    fn test_error_retry_after_hint() {
        let json = r#"{"type":"error","code":"rate_limit_exceeded","message":"slow down","details":{"retry_after":7}}"#;
        let parsed: ControlMessage = serde_json::from_str(json).unwrap();
        match parsed {
            ControlMessage::Error(e) => {
                assert_eq!(e.retry_after(), Some(Duration::from_secs(7)));
            }
            other => panic!("expected error, got {}", other.type_name()),
        }
    }

    #[test]
    fn test_version_profiles() {
        assert_eq!(ProtocolVersion::parse("1.0.0"), Some(ProtocolVersion::V1));
        assert_eq!(ProtocolVersion::parse("2.0"), Some(ProtocolVersion::V2));
        assert_eq!(ProtocolVersion::parse("3.1"), None);
        assert!(ProtocolVersion::V2.default_features().contains(&"multi_tenant"));
        assert!(ProtocolVersion::V1.default_features().contains(&"jwt"));
    }
}
