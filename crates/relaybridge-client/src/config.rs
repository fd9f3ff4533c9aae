//! Typed configuration surface.
//!
//! Options layer as defaults → optional file (YAML/TOML/JSON) → environment
//! variables under the `RELAYBRIDGE_` prefix with `__` separating nested
//! keys, e.g. `RELAYBRIDGE_SERVER__HOST`. Durations are plain seconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use relaybridge_protocol::ProtocolVersion;
use relaybridge_transport::{RateLimitConfig, TlsOptions, TransportPolicy};

use crate::error::{ClientError, ClientResult};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "RELAYBRIDGE";

/// Complete client configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Relay address and credentials
    pub server: ServerConfig,
    /// TLS policy
    pub tls: TlsConfig,
    /// Control protocol profile
    pub protocol: ProtocolConfig,
    /// Multi-tenant identity
    pub tenant: TenantConfig,
    /// Default tunnel and supervisor tuning
    pub tunnel: TunnelConfig,
    /// Rate limiter tuning
    pub rate_limit: RateLimitSection,
    /// Metrics exposition
    pub metrics: MetricsConfig,
    /// Health exposition
    pub health: HealthSection,
    /// Logging (consumed by the binary)
    pub logging: LoggingConfig,
}

/// Relay address and credentials
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Relay host
    pub host: String,
    /// Relay port
    pub port: u16,
    /// Bearer token presented in `auth`
    pub jwt_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8443,
            jwt_token: None,
        }
    }
}

/// TLS policy for all transports
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Wrap the TCP transport in TLS
    pub enabled: bool,
    /// Client certificate chain, PEM
    pub cert_file: Option<PathBuf>,
    /// Client private key, PEM
    pub key_file: Option<PathBuf>,
    /// Trust root bundle, PEM
    pub ca_file: Option<PathBuf>,
    /// Minimum TLS version, `1.2` or `1.3`
    pub min_version: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cert_file: None,
            key_file: None,
            ca_file: None,
            min_version: "1.2".to_string(),
        }
    }
}

impl TlsConfig {
    /// Convert to the transport layer's options
    pub fn to_options(&self) -> TlsOptions {
        TlsOptions {
            enabled: self.enabled,
            cert_file: self.cert_file.clone(),
            key_file: self.key_file.clone(),
            ca_file: self.ca_file.clone(),
            min_version: Some(self.min_version.clone()),
        }
    }
}

/// Control protocol profile
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// `1.0.0` or `2.0`
    pub version: String,
    /// Feature override; version profile defaults when unset
    pub features: Option<Vec<String>>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            version: ProtocolVersion::V2.as_str().to_string(),
            features: None,
        }
    }
}

/// Multi-tenant identity
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TenantConfig {
    /// Tenant identifier sent in v2 `auth`
    pub id: Option<String>,
    /// Display name, informational
    pub name: Option<String>,
}

/// Default tunnel and supervisor tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Tunnel identifier to propose; random when unset
    pub id: Option<String>,
    /// Local listening port of the default tunnel
    pub local_port: Option<u16>,
    /// Remote host of the default tunnel
    pub remote_host: Option<String>,
    /// Remote port of the default tunnel
    pub remote_port: Option<u16>,
    /// Initial reconnect delay, seconds
    pub reconnect_delay: u64,
    /// Reconnect attempts before giving up
    pub max_retries: u32,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            id: None,
            local_port: None,
            remote_host: None,
            remote_port: None,
            reconnect_delay: 1,
            max_retries: 5,
        }
    }
}

impl TunnelConfig {
    /// The configured default tunnel, when all three endpoints are set
    pub fn default_tunnel(&self) -> Option<(u16, String, u16)> {
        match (self.local_port, &self.remote_host, self.remote_port) {
            (Some(local), Some(host), Some(remote)) => Some((local, host.clone(), remote)),
            _ => None,
        }
    }
}

/// Rate limiter tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    /// Admissions allowed per window
    pub max_requests: u32,
    /// Window duration, seconds
    pub window_size: u64,
    /// Backoff ceiling, seconds
    pub max_backoff: u64,
    /// Backoff growth factor
    pub backoff_multiplier: f64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window_size: 60,
            max_backoff: 300,
            backoff_multiplier: 2.0,
        }
    }
}

impl RateLimitSection {
    /// Convert to the transport layer's configuration
    pub fn to_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_requests: self.max_requests,
            window_size: Duration::from_secs(self.window_size),
            backoff_multiplier: self.backoff_multiplier,
            max_backoff: Duration::from_secs(self.max_backoff),
            ..RateLimitConfig::default()
        }
    }
}

/// Metrics exposition
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve the exposition endpoints
    pub enabled: bool,
    /// Listen port for `/metrics`, `/health`, `/ready`, `/live`
    pub port: u16,
    /// Metrics path
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 2112,
            path: "/metrics".to_string(),
        }
    }
}

/// Health exposition
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    /// Health path on the exposition server
    pub path: String,
    /// Interval between registry ticks, seconds
    pub check_interval: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            path: "/health".to_string(),
            check_interval: 30,
        }
    }
}

/// Logging options, consumed by the binary
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log filter level
    pub level: String,
    /// `text` or `json`
    pub format: String,
    /// Log file; stderr when unset
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the optional file, then
    /// environment variables under [`ENV_PREFIX`]
    pub fn load(path: Option<&Path>) -> ClientResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__"),
        );
        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate cross-field invariants. Call after CLI overrides.
    pub fn validate(&self) -> ClientResult<()> {
        if ProtocolVersion::parse(&self.protocol.version).is_none() {
            return Err(ClientError::Config(format!(
                "unsupported protocol.version {:?} (expected \"1.0.0\" or \"2.0\")",
                self.protocol.version
            )));
        }
        if self.server.host.is_empty() {
            return Err(ClientError::Config("server.host is empty".to_string()));
        }
        if self.server.jwt_token.as_deref().is_none_or(str::is_empty) {
            return Err(ClientError::Config(
                "server.jwt_token is required (set it in the config file, via \
                 RELAYBRIDGE_SERVER__JWT_TOKEN, or with --token)"
                    .to_string(),
            ));
        }
        if !matches!(self.tls.min_version.as_str(), "1.2" | "1.3") {
            return Err(ClientError::Config(format!(
                "unsupported tls.min_version {:?} (expected \"1.2\" or \"1.3\")",
                self.tls.min_version
            )));
        }
        if self.rate_limit.max_requests == 0 {
            return Err(ClientError::Config(
                "rate_limit.max_requests must be at least 1".to_string(),
            ));
        }
        TransportPolicy::default()
            .validate()
            .map_err(ClientError::Config)?;
        Ok(())
    }

    /// Parsed protocol version; `validate` guarantees this succeeds
    pub fn protocol_version(&self) -> ClientResult<ProtocolVersion> {
        ProtocolVersion::parse(&self.protocol.version).ok_or_else(|| {
            ClientError::Config(format!(
                "unsupported protocol.version {:?}",
                self.protocol.version
            ))
        })
    }

    /// Health check interval as a duration
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health.check_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.server.jwt_token = Some("token".to_string());
        config
    }

    #[test]
    fn test_defaults_match_contract() {
        let config = Config::default();
        assert_eq!(config.server.port, 8443);
        assert_eq!(config.protocol.version, "2.0");
        assert_eq!(config.tunnel.reconnect_delay, 1);
        assert_eq!(config.tunnel.max_retries, 5);
        assert_eq!(config.rate_limit.window_size, 60);
        assert_eq!(config.health.check_interval, 30);
        assert_eq!(config.metrics.path, "/metrics");
        assert!(config.tls.enabled);
    }

    #[test]
    fn test_validation_requires_token() {
        let config = Config::default();
        assert!(matches!(
            config.validate(),
            Err(ClientError::Config(msg)) if msg.contains("jwt_token")
        ));
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_version() {
        let mut config = valid_config();
        config.protocol.version = "3.0".to_string();
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.tls.min_version = "1.1".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_tunnel_requires_all_endpoints() {
        let mut config = Config::default();
        assert!(config.tunnel.default_tunnel().is_none());
        config.tunnel.local_port = Some(8080);
        config.tunnel.remote_host = Some("db.internal".to_string());
        assert!(config.tunnel.default_tunnel().is_none());
        config.tunnel.remote_port = Some(5432);
        assert_eq!(
            config.tunnel.default_tunnel(),
            Some((8080, "db.internal".to_string(), 5432))
        );
    }

    #[test]
    fn test_rate_limit_conversion() {
        let section = RateLimitSection {
            max_requests: 5,
            window_size: 10,
            max_backoff: 60,
            backoff_multiplier: 3.0,
        };
        let config = section.to_config();
        assert_eq!(config.max_requests, 5);
        assert_eq!(config.window_size, Duration::from_secs(10));
        assert_eq!(config.max_backoff, Duration::from_secs(60));
        assert_eq!(config.backoff_multiplier, 3.0);
    }
}
