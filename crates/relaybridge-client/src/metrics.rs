//! Metrics registry: recorder installation, schema description, and the
//! record helpers the rest of the client calls.
//!
//! The schema is fixed at startup; every series below is described when the
//! recorder is installed so the exposition is self-documenting.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use relaybridge_transport::TransportKind;

use crate::error::{ClientError, ClientResult};
use crate::tunnel::Direction;

/// Latency buckets shared by every `*_seconds` histogram
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Install the Prometheus recorder and describe the schema. Returns the
/// handle the exposition endpoint renders from.
pub fn install() -> ClientResult<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets(LATENCY_BUCKETS)
        .map_err(|e| ClientError::Metrics(e.to_string()))?
        .install_recorder()
        .map_err(|e| ClientError::Metrics(e.to_string()))?;
    describe_schema();
    gauge!("build_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);
    Ok(handle)
}

fn describe_schema() {
    describe_counter!("connections_total", "Connection attempts by outcome");
    describe_gauge!("active_connections", "Live control sessions");
    describe_histogram!(
        "connection_duration_seconds",
        "Lifetime of established sessions"
    );
    describe_histogram!(
        "protocol_latency_seconds",
        "Latency of transport operations"
    );
    describe_counter!("protocol_errors_total", "Transport failures by kind");
    describe_counter!("protocol_switches_total", "Transport migrations");
    describe_counter!("protocol_success_total", "Successful transport operations");
    describe_counter!("tunnels_created_total", "Tunnel requests by outcome");
    describe_counter!("tunnel_bytes_total", "Tunnel payload bytes by direction");
    describe_counter!("auth_attempts_total", "Authentication attempts by outcome");
    describe_counter!("heartbeat_total", "Heartbeats by outcome");
    describe_histogram!("heartbeat_latency_seconds", "Heartbeat round-trip time");
    describe_counter!("missed_heartbeats_total", "Heartbeat timeouts");
    describe_gauge!("health_check_status", "Per-check health, 1 healthy 0 not");
    describe_histogram!("health_check_latency_seconds", "Health check duration");
    describe_counter!("rate_limit_denials_total", "Rate limiter denials");
    describe_gauge!("circuit_state", "Breaker state: 0 closed, 1 half-open, 2 open");
    describe_gauge!("build_info", "Build metadata, always 1");
}

/// Count a connection attempt outcome
pub fn record_connection(status: &'static str) {
    counter!("connections_total", "status" => status).increment(1);
}

/// Track the live-session gauge
pub fn session_started() {
    gauge!("active_connections").increment(1.0);
}

/// Track the live-session gauge
pub fn session_ended(duration: Duration) {
    gauge!("active_connections").decrement(1.0);
    histogram!("connection_duration_seconds").record(duration.as_secs_f64());
}

/// Record the latency of a transport operation
pub fn record_protocol_latency(kind: TransportKind, operation: &'static str, latency: Duration) {
    histogram!(
        "protocol_latency_seconds",
        "transport" => kind.as_str(),
        "operation" => operation
    )
    .record(latency.as_secs_f64());
}

/// Count an authentication attempt outcome
pub fn record_auth_attempt(status: &'static str) {
    counter!("auth_attempts_total", "status" => status).increment(1);
}

/// Count a heartbeat outcome
pub fn record_heartbeat(status: &'static str) {
    counter!("heartbeat_total", "status" => status).increment(1);
}

/// Record a heartbeat round trip
pub fn record_heartbeat_latency(latency: Duration) {
    histogram!("heartbeat_latency_seconds").record(latency.as_secs_f64());
}

/// Count a heartbeat timeout
pub fn record_missed_heartbeat() {
    counter!("missed_heartbeats_total").increment(1);
}

/// Count a tunnel request outcome
pub fn record_tunnel_created(status: &'static str) {
    counter!("tunnels_created_total", "status" => status).increment(1);
}

/// Count payload bytes moved through a tunnel
pub fn record_tunnel_bytes(tunnel_id: &str, direction: Direction, bytes: u64) {
    counter!(
        "tunnel_bytes_total",
        "direction" => direction.as_str(),
        "tunnel_id" => tunnel_id.to_string()
    )
    .increment(bytes);
}

/// Record one health check evaluation
pub fn record_health_check(name: &'static str, healthy: bool, latency: Duration) {
    gauge!("health_check_status", "name" => name).set(if healthy { 1.0 } else { 0.0 });
    histogram!("health_check_latency_seconds", "name" => name).record(latency.as_secs_f64());
}
