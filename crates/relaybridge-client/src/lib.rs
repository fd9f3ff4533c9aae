//! # Relaybridge Client
//!
//! Long-lived client that keeps an authenticated control channel to a
//! relay and maintains TCP port-forwarding tunnels through it.
//!
//! The pieces, leaves first: the transport layer and its resilience
//! primitives live in `relaybridge-transport`; the wire protocol in
//! `relaybridge-protocol`. This crate wires them together:
//!
//! - [`config`]: the flat option surface (file + environment + CLI)
//! - [`supervisor`]: the reconnect loop owning the current session
//! - [`session`]: one live control session over one transport
//! - [`tunnel`]: tunnel declarations and byte accounting
//! - [`health`]: periodic named checks feeding `/health`
//! - [`metrics`]: the fixed metric schema and record helpers
//! - [`expose`]: the `/metrics`, `/health`, `/ready`, `/live` endpoints
//!
//! Everything is explicitly constructed and passed by reference to the
//! supervisor at startup; there are no process-wide singletons apart from
//! the metrics recorder the exporter crate requires.

pub mod cli;
pub mod config;
pub mod error;
pub mod expose;
pub mod health;
pub mod metrics;
pub mod session;
pub mod supervisor;
pub mod tunnel;

pub use cli::Cli;
pub use config::Config;
pub use error::{ClientError, ClientResult};
pub use health::{HealthRegistry, HealthStatus};
pub use session::{Session, SessionEnd, SessionOptions};
pub use supervisor::{Supervisor, SupervisorOptions};
pub use tunnel::{Direction, Tunnel, TunnelManager, TunnelStatus};
