//! Command line surface. The CLI only overrides configuration; all policy
//! lives in [`crate::config::Config`].

use std::path::PathBuf;

use clap::Parser;

use crate::config::Config;

/// Fault-tolerant relay tunnel client
#[derive(Debug, Parser)]
#[command(name = "relaybridge", version, about)]
pub struct Cli {
    /// Configuration file (YAML, TOML, or JSON)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Bearer token; required when no config file provides one
    #[arg(long, env = "RELAYBRIDGE_TOKEN")]
    pub token: Option<String>,

    /// Tunnel identifier to propose for the default tunnel
    #[arg(long)]
    pub tunnel_id: Option<String>,

    /// Local listening port of the default tunnel
    #[arg(long)]
    pub local_port: Option<u16>,

    /// Remote host of the default tunnel
    #[arg(long)]
    pub remote_host: Option<String>,

    /// Remote port of the default tunnel
    #[arg(long)]
    pub remote_port: Option<u16>,

    /// Log at debug level regardless of logging.level
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Apply the flag overrides on top of the loaded configuration
    pub fn apply(&self, config: &mut Config) {
        if let Some(token) = &self.token {
            config.server.jwt_token = Some(token.clone());
        }
        if let Some(tunnel_id) = &self.tunnel_id {
            config.tunnel.id = Some(tunnel_id.clone());
        }
        if let Some(local_port) = self.local_port {
            config.tunnel.local_port = Some(local_port);
        }
        if let Some(remote_host) = &self.remote_host {
            config.tunnel.remote_host = Some(remote_host.clone());
        }
        if let Some(remote_port) = self.remote_port {
            config.tunnel.remote_port = Some(remote_port);
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_apply() {
        let cli = Cli::parse_from([
            "relaybridge",
            "--token",
            "tok",
            "--local-port",
            "8080",
            "--remote-host",
            "db.internal",
            "--remote-port",
            "5432",
            "--tunnel-id",
            "tun-1",
            "--verbose",
        ]);
        let mut config = Config::default();
        cli.apply(&mut config);
        assert_eq!(config.server.jwt_token.as_deref(), Some("tok"));
        assert_eq!(config.tunnel.local_port, Some(8080));
        assert_eq!(config.tunnel.remote_host.as_deref(), Some("db.internal"));
        assert_eq!(config.tunnel.remote_port, Some(5432));
        assert_eq!(config.tunnel.id.as_deref(), Some("tun-1"));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_defaults_leave_config_untouched() {
        let cli = Cli::parse_from(["relaybridge"]);
        let mut config = Config::default();
        cli.apply(&mut config);
        assert!(config.server.jwt_token.is_none());
        assert_eq!(config.logging.level, "info");
    }
}
