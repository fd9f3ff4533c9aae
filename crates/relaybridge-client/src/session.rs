//! Live control session.
//!
//! One task owns the transport after the handshake: it serialises every
//! outbound frame (heartbeats never interleave with tunnel requests inside
//! a frame), dispatches inbound frames in arrival order, drives the
//! heartbeat schedule, and periodically asks the selector whether the
//! session should migrate to a better transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use relaybridge_protocol::{
    ControlMessage, ErrorClass, Negotiated, TunnelInfo, TunnelResponse, classify_code,
    decode_message, encode_message,
};
use relaybridge_transport::{ProtocolSelector, RateLimiter, Transport, TransportKind};

use crate::error::ClientError;
use crate::metrics;

/// Requests routed into the session task
#[derive(Debug)]
pub enum SessionCommand {
    /// Declare a tunnel and report the relay's verdict
    OpenTunnel {
        /// The declaration to send
        request: TunnelInfo,
        /// Where the verdict goes
        reply: oneshot::Sender<Result<TunnelResponse, ClientError>>,
    },
}

/// Why a session ended
#[derive(Debug)]
pub enum SessionEnd {
    /// Shutdown was requested; do not reconnect
    Shutdown,
    /// The selector recommended a better transport
    Migrate {
        /// Transport to move to
        to: TransportKind,
    },
    /// The relay reported a non-retryable condition
    Fatal {
        /// Server error code
        code: String,
        /// Server-provided description
        message: String,
    },
    /// Transient failure; the supervisor reconnects
    Failed {
        /// Short reason for logs and metrics
        reason: String,
    },
}

/// Session tuning
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Heartbeat period H; a session fails after 2·H without a response
    pub heartbeat_interval: Duration,
    /// How often the selector is consulted about migration
    pub migration_check_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            migration_check_interval: Duration::from_secs(60),
        }
    }
}

/// A live session over one transport instance
pub struct Session {
    transport: Box<dyn Transport>,
    kind: TransportKind,
    negotiated: Negotiated,
    principal: String,
    options: SessionOptions,
    cancel: CancellationToken,
    commands: mpsc::Receiver<SessionCommand>,
    selector: Arc<ProtocolSelector>,
    limiter: Arc<RateLimiter>,
    pending_tunnels: HashMap<String, oneshot::Sender<Result<TunnelResponse, ClientError>>>,
}

impl Session {
    /// Wrap an established transport into a session task
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Box<dyn Transport>,
        kind: TransportKind,
        negotiated: Negotiated,
        principal: String,
        options: SessionOptions,
        cancel: CancellationToken,
        commands: mpsc::Receiver<SessionCommand>,
        selector: Arc<ProtocolSelector>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            transport,
            kind,
            negotiated,
            principal,
            options,
            cancel,
            commands,
            selector,
            limiter,
            pending_tunnels: HashMap::new(),
        }
    }

    /// What the handshake negotiated for this session
    pub fn negotiated(&self) -> &Negotiated {
        &self.negotiated
    }

    /// Drive the session until it ends
    pub async fn run(mut self) -> SessionEnd {
        let heartbeat_enabled = self.negotiated.has_feature("heartbeat");
        let period = self.options.heartbeat_interval;
        let mut heartbeat =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut migration = tokio::time::interval_at(
            tokio::time::Instant::now() + self.options.migration_check_interval,
            self.options.migration_check_interval,
        );
        migration.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // No response is expected before the first heartbeat, so the clock
        // starts at establishment.
        let mut last_response = Instant::now();
        let mut in_flight: Option<Instant> = None;

        let end = loop {
            tokio::select! {
                () = self.cancel.cancelled() => break SessionEnd::Shutdown,

                command = self.commands.recv() => match command {
                    Some(SessionCommand::OpenTunnel { request, reply }) => {
                        let frame = ControlMessage::TunnelInfo(request.clone());
                        match self.send_message(&frame).await {
                            Ok(()) => {
                                self.pending_tunnels.insert(request.tunnel_id, reply);
                            }
                            Err(e) => {
                                let reason = e.to_string();
                                let _ = reply.send(Err(e));
                                break SessionEnd::Failed { reason };
                            }
                        }
                    }
                    None => break SessionEnd::Shutdown,
                },

                frame = self.transport.recv() => match frame {
                    Ok(frame) => {
                        match self.dispatch(&frame, &mut last_response, &mut in_flight) {
                            None => {}
                            Some(end) => break end,
                        }
                    }
                    Err(e) => {
                        warn!(transport = %self.kind, error = %e, "session receive failed");
                        break SessionEnd::Failed { reason: e.kind_label().to_string() };
                    }
                },

                _ = heartbeat.tick(), if heartbeat_enabled => {
                    if last_response.elapsed() >= period * 2 {
                        metrics::record_missed_heartbeat();
                        metrics::record_heartbeat("timeout");
                        warn!(transport = %self.kind, "no heartbeat response within twice the interval");
                        break SessionEnd::Failed { reason: "heartbeat_timeout".to_string() };
                    }
                    match self.send_message(&ControlMessage::Heartbeat).await {
                        Ok(()) => {
                            in_flight = Some(Instant::now());
                            metrics::record_heartbeat("sent");
                        }
                        Err(e) => {
                            metrics::record_heartbeat("failed");
                            break SessionEnd::Failed { reason: e.to_string() };
                        }
                    }
                }

                _ = migration.tick() => {
                    if let Some(target) = self.selector.should_switch(self.kind) {
                        break SessionEnd::Migrate { to: target };
                    }
                }
            }
        };

        self.teardown().await;
        end
    }

    async fn send_message(&mut self, message: &ControlMessage) -> Result<(), ClientError> {
        let frame = encode_message(message)?;
        self.transport.send(frame).await?;
        Ok(())
    }

    /// Interpret one inbound frame; `Some` ends the session
    fn dispatch(
        &mut self,
        frame: &[u8],
        last_response: &mut Instant,
        in_flight: &mut Option<Instant>,
    ) -> Option<SessionEnd> {
        let message = match decode_message(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "malformed control frame, closing session");
                return Some(SessionEnd::Failed {
                    reason: "framing".to_string(),
                });
            }
        };

        match message {
            ControlMessage::HeartbeatResponse => {
                *last_response = Instant::now();
                if let Some(sent_at) = in_flight.take() {
                    metrics::record_heartbeat_latency(sent_at.elapsed());
                }
                metrics::record_heartbeat("success");
                None
            }
            ControlMessage::TunnelResponse(response) => {
                match self.pending_tunnels.remove(&response.tunnel_id) {
                    Some(reply) => {
                        let _ = reply.send(Ok(response));
                    }
                    None => {
                        warn!(tunnel_id = %response.tunnel_id, "tunnel_response without a pending request");
                    }
                }
                None
            }
            ControlMessage::Error(err) => self.on_error(err),
            ControlMessage::Unknown => {
                debug!("ignoring control frame with unknown type");
                None
            }
            other => {
                debug!(message = other.type_name(), "ignoring unexpected control frame");
                None
            }
        }
    }

    fn on_error(&mut self, err: relaybridge_protocol::ErrorMessage) -> Option<SessionEnd> {
        match classify_code(&err.code) {
            ErrorClass::Fatal => Some(SessionEnd::Fatal {
                code: err.code,
                message: err.message,
            }),
            ErrorClass::RetryableWithHint => {
                if let Some(hint) = err.retry_after() {
                    self.limiter.penalize(&self.principal, hint);
                }
                warn!(code = %err.code, "relay applied backpressure: {}", err.message);
                Some(SessionEnd::Failed { reason: err.code })
            }
            ErrorClass::Retryable => {
                warn!(code = %err.code, "relay reported an error: {}", err.message);
                Some(SessionEnd::Failed { reason: err.code })
            }
            ErrorClass::TunnelRejected => {
                let rejected = err
                    .details
                    .as_ref()
                    .and_then(|d| d.get("tunnel_id"))
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string)
                    .or_else(|| {
                        // Without an id we can only attribute the rejection
                        // when exactly one request is outstanding.
                        (self.pending_tunnels.len() == 1)
                            .then(|| self.pending_tunnels.keys().next().cloned())
                            .flatten()
                    });
                match rejected.and_then(|id| self.pending_tunnels.remove(&id)) {
                    Some(reply) => {
                        let _ = reply.send(Err(ClientError::TunnelRejected(err.message)));
                    }
                    None => {
                        warn!(code = %err.code, "tunnel rejection without a pending request: {}", err.message);
                    }
                }
                None
            }
            ErrorClass::Advisory => {
                debug!(code = %err.code, "advisory from relay: {}", err.message);
                None
            }
        }
    }

    async fn teardown(&mut self) {
        // Outstanding requests fail fast rather than waiting for a timeout
        for (_, reply) in self.pending_tunnels.drain() {
            let _ = reply.send(Err(ClientError::NotConnected));
        }
        let _ = self.transport.close().await;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("kind", &self.kind)
            .field("principal", &self.principal)
            .field("pending_tunnels", &self.pending_tunnels.len())
            .finish_non_exhaustive()
    }
}
