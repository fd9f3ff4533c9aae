//! Reconnect supervisor.
//!
//! One long-lived task ties the selector, circuit breaker, rate limiter,
//! control engine, and tunnel manager together: admit the attempt, pick a
//! transport, dial through the breaker, run the handshake, then supervise
//! the session until it ends. Transient failures back off exponentially;
//! fatal authentication errors abort; shutdown is graceful and idempotent.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relaybridge_protocol::{
    ClientInfo, ErrorClass, Handshake, HandshakeConfig, Negotiated, ProtocolError, Step,
    classify_code, decode_message, encode_message,
};
use relaybridge_transport::{
    CircuitBreaker, ProtocolSelector, RateLimiter, Transport, TransportError, TransportFactory,
    TransportKind,
};

use crate::config::Config;
use crate::error::{ClientError, ClientResult};
use crate::metrics;
use crate::session::{Session, SessionEnd, SessionOptions};
use crate::tunnel::TunnelManager;

/// Supervisor timing knobs
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Reconnect attempts before giving up
    pub max_retries: u32,
    /// First reconnect delay
    pub initial_delay: Duration,
    /// Reconnect delay ceiling
    pub max_backoff: Duration,
    /// Per-dial deadline
    pub connect_timeout: Duration,
    /// Per-frame read deadline during the handshake
    pub request_timeout: Duration,
    /// Session tuning handed to each established session
    pub session: SessionOptions,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            session: SessionOptions::default(),
        }
    }
}

impl SupervisorOptions {
    /// Derive options from the configuration
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.tunnel.max_retries,
            initial_delay: Duration::from_secs(config.tunnel.reconnect_delay.max(1)),
            ..Self::default()
        }
    }
}

/// Owns the reconnect loop and the current session
pub struct Supervisor {
    config: Config,
    options: SupervisorOptions,
    factory: TransportFactory,
    selector: Arc<ProtocolSelector>,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    tunnels: TunnelManager,
    established: watch::Sender<bool>,
    cancel: CancellationToken,
    client_id: Option<String>,
}

impl Supervisor {
    /// Wire a supervisor from explicitly constructed collaborators
    pub fn new(
        config: Config,
        options: SupervisorOptions,
        selector: Arc<ProtocolSelector>,
        breaker: Arc<CircuitBreaker>,
        limiter: Arc<RateLimiter>,
        tunnels: TunnelManager,
    ) -> ClientResult<Self> {
        config.validate()?;
        let factory = TransportFactory::new(
            config.server.host.clone(),
            config.server.port,
            config.tls.to_options(),
        );
        let (established, _) = watch::channel(false);
        Ok(Self {
            config,
            options,
            factory,
            selector,
            breaker,
            limiter,
            tunnels,
            established,
            cancel: CancellationToken::new(),
            client_id: None,
        })
    }

    /// Watch whether a session is currently established
    pub fn established_watch(&self) -> watch::Receiver<bool> {
        self.established.subscribe()
    }

    /// Token cancelled when shutdown is requested
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request a graceful shutdown. Safe to call any number of times.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// The identity used for rate limiting: tenant id, then the
    /// server-assigned client id, then `"anonymous"`
    fn principal(&self) -> String {
        self.config
            .tenant
            .id
            .clone()
            .or_else(|| self.client_id.clone())
            .unwrap_or_else(|| "anonymous".to_string())
    }

    /// Run until shutdown, a fatal error, or exhausted retries
    pub async fn run(&mut self) -> ClientResult<()> {
        info!(
            host = %self.config.server.host,
            port = self.config.server.port,
            version = %self.config.protocol.version,
            "supervisor starting"
        );

        let mut retries: u32 = 0;
        let mut backoff = self.options.initial_delay;
        let mut last_kind: Option<TransportKind> = None;

        loop {
            if self.cancel.is_cancelled() {
                info!("shutdown requested");
                return Ok(());
            }

            let principal = self.principal();
            let admission = self.limiter.allow(&principal);
            if !admission.admitted {
                let wait = admission.retry_after.unwrap_or(self.options.initial_delay);
                warn!(principal = %principal, wait = ?wait, "rate limited, deferring connection attempt");
                if self.sleep_or_shutdown(wait).await {
                    return Ok(());
                }
                continue;
            }

            let kind = self.selector.optimal_for();
            if let Some(previous) = last_kind {
                if previous != kind {
                    self.selector.mark_switched(previous, kind);
                }
            }
            last_kind = Some(kind);
            let mut transport = self.factory.build(kind)?;
            debug!(transport = %kind, endpoint = %transport.endpoint(), "dialling relay");

            let dial_started = Instant::now();
            let connect_timeout = self.options.connect_timeout;
            let cancel = self.cancel.clone();
            let dialled = self
                .breaker
                .execute(|| transport.connect(connect_timeout, &cancel))
                .await;

            match dialled {
                Err(TransportError::Cancelled) => return Ok(()),
                Err(TransportError::CircuitOpen) => {
                    metrics::record_connection("circuit_open");
                    warn!("circuit breaker open, waiting before the next dial");
                    if self.sleep_or_shutdown(self.breaker.open_duration()).await {
                        return Ok(());
                    }
                    continue;
                }
                Err(e) => {
                    metrics::record_connection("failure");
                    self.selector.record_failure(kind, e.kind_label());
                    if retries > self.options.max_retries {
                        error!(error = %e, attempts = retries, "max reconnect attempts reached");
                        return Err(ClientError::RetriesExhausted);
                    }
                    warn!(transport = %kind, error = %e, backoff = ?backoff, "connect failed, backing off");
                    if self.sleep_or_shutdown(jittered(backoff)).await {
                        return Ok(());
                    }
                    backoff = (backoff * 2).min(self.options.max_backoff);
                    retries += 1;
                    continue;
                }
                Ok(()) => {}
            }

            let dial_latency = dial_started.elapsed();
            metrics::record_protocol_latency(kind, "connect", dial_latency);

            let negotiated = match self.perform_handshake(transport.as_mut()).await {
                Ok(negotiated) => negotiated,
                Err(ClientError::AuthFatal { code, message }) => {
                    metrics::record_auth_attempt("failed");
                    let _ = transport.close().await;
                    error!(code = %code, "authentication rejected by relay: {message}");
                    return Err(ClientError::AuthFatal { code, message });
                }
                Err(e) => {
                    if let ClientError::Protocol(ProtocolError::Server {
                        code, retry_after, ..
                    }) = &e
                    {
                        metrics::record_auth_attempt("failed");
                        if classify_code(code) == ErrorClass::RetryableWithHint {
                            if let Some(hint) = retry_after {
                                self.limiter.penalize(&principal, *hint);
                            }
                        }
                    }
                    let _ = transport.close().await;
                    self.selector.record_failure(kind, "handshake");
                    if retries > self.options.max_retries {
                        error!(error = %e, attempts = retries, "max reconnect attempts reached");
                        return Err(ClientError::RetriesExhausted);
                    }
                    warn!(transport = %kind, error = %e, backoff = ?backoff, "handshake failed, backing off");
                    if self.sleep_or_shutdown(jittered(backoff)).await {
                        return Ok(());
                    }
                    backoff = (backoff * 2).min(self.options.max_backoff);
                    retries += 1;
                    continue;
                }
            };

            metrics::record_connection("success");
            metrics::record_auth_attempt("success");
            self.selector.record_success(kind, dial_latency);
            self.client_id.clone_from(&negotiated.client_id);
            retries = 0;
            backoff = self.options.initial_delay;

            info!(
                transport = %kind,
                version = %negotiated.version,
                client_id = ?negotiated.client_id,
                session_id = ?negotiated.session_id,
                features = ?negotiated.features,
                "session established"
            );

            metrics::session_started();
            let _ = self.established.send(true);
            let session_started = Instant::now();
            let end = self.supervise(transport, kind, negotiated).await;
            let _ = self.established.send(false);
            metrics::session_ended(session_started.elapsed());

            match end {
                SessionEnd::Shutdown => {
                    info!("session closed, shutting down");
                    return Ok(());
                }
                SessionEnd::Fatal { code, message } => {
                    error!(code = %code, "fatal session error: {message}");
                    return Err(ClientError::AuthFatal { code, message });
                }
                SessionEnd::Migrate { to } => {
                    info!(from = %kind, to = %to, "session migrating to a better transport");
                    continue;
                }
                SessionEnd::Failed { reason } => {
                    info!(reason = %reason, "session ended, reconnecting");
                    continue;
                }
            }
        }
    }

    /// Drive the hello/auth exchange on a freshly connected transport
    async fn perform_handshake(
        &self,
        transport: &mut dyn Transport,
    ) -> ClientResult<Negotiated> {
        let token = self
            .config
            .server
            .jwt_token
            .clone()
            .ok_or_else(|| ClientError::Config("server.jwt_token is required".to_string()))?;
        let mut handshake = Handshake::new(HandshakeConfig {
            version: self.config.protocol_version()?,
            features: self.config.protocol.features.clone(),
            token,
            tenant_id: self.config.tenant.id.clone(),
            client_info: ClientInfo::current(),
        });

        let opening = handshake.open()?;
        transport.send(encode_message(&opening)?).await?;

        loop {
            let frame =
                match tokio::time::timeout(self.options.request_timeout, transport.recv()).await {
                    Err(_) => return Err(ClientError::Timeout),
                    Ok(result) => result?,
                };
            let message = decode_message(&frame)?;
            match handshake.on_message(message) {
                Ok(Step::Send(reply)) => transport.send(encode_message(&reply)?).await?,
                Ok(Step::Established(negotiated)) => return Ok(*negotiated),
                Ok(Step::Wait) => {}
                Err(e) => return Err(classify_handshake_error(e)),
            }
        }
    }

    /// Hand an established transport to a session task and await its end
    async fn supervise(
        &mut self,
        transport: Box<dyn Transport>,
        kind: TransportKind,
        negotiated: Negotiated,
    ) -> SessionEnd {
        let (commands, command_rx) = tokio::sync::mpsc::channel(16);
        self.tunnels.bind_session(commands);
        self.request_default_tunnel();

        let session = Session::new(
            transport,
            kind,
            negotiated,
            self.principal(),
            self.options.session.clone(),
            self.cancel.clone(),
            command_rx,
            Arc::clone(&self.selector),
            Arc::clone(&self.limiter),
        );
        let end = session.run().await;
        self.tunnels.unbind_session();
        end
    }

    /// Declare the configured default tunnel on the fresh session
    fn request_default_tunnel(&self) {
        let Some((local_port, remote_host, remote_port)) = self.config.tunnel.default_tunnel()
        else {
            return;
        };
        let tunnels = self.tunnels.clone();
        let tunnel_id = self.config.tunnel.id.clone();
        tokio::spawn(async move {
            match tunnels
                .create(local_port, &remote_host, remote_port, tunnel_id)
                .await
            {
                Ok(tunnel) => {
                    debug!(tunnel_id = %tunnel.tunnel_id, "default tunnel ready");
                }
                Err(e) => {
                    warn!(error = %e, "default tunnel request failed");
                }
            }
        });
    }

    /// Sleep unless shutdown arrives first; true means shut down
    async fn sleep_or_shutdown(&self, duration: Duration) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => true,
            () = tokio::time::sleep(duration) => false,
        }
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("host", &self.config.server.host)
            .field("port", &self.config.server.port)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

/// Jitter factor (0.0 - 1.0) applied to reconnect sleeps so restarting
/// fleets do not redial in lockstep
const JITTER_FACTOR: f64 = 0.1;

/// Spread a reconnect sleep by ±`JITTER_FACTOR`. The backoff progression
/// itself stays deterministic; only the sleep is spread.
fn jittered(backoff: Duration) -> Duration {
    let jitter = 1.0 + (fastrand::f64() - 0.5) * 2.0 * JITTER_FACTOR;
    backoff.mul_f64(jitter)
}

/// Map a handshake failure onto the client's error taxonomy
fn classify_handshake_error(err: ProtocolError) -> ClientError {
    match &err {
        ProtocolError::Server { code, message, .. }
            if classify_code(code) == ErrorClass::Fatal =>
        {
            ClientError::AuthFatal {
                code: code.clone(),
                message: message.clone(),
            }
        }
        _ => ClientError::Protocol(err),
    }
}

#[cfg(test)]
mod tests {
    use relaybridge_transport::{
        CircuitBreakerConfig, RateLimitConfig, TransportPolicy,
    };

    use super::*;

    fn supervisor_with_token(token: Option<&str>) -> ClientResult<Supervisor> {
        let mut config = Config::default();
        config.server.jwt_token = token.map(str::to_string);
        Supervisor::new(
            config,
            SupervisorOptions::default(),
            Arc::new(ProtocolSelector::new(TransportPolicy::default())),
            Arc::new(CircuitBreaker::new("relay", CircuitBreakerConfig::default())),
            Arc::new(RateLimiter::new(RateLimitConfig::default())),
            TunnelManager::new(Duration::from_secs(30)),
        )
    }

    #[test]
    fn test_new_requires_token() {
        assert!(matches!(
            supervisor_with_token(None),
            Err(ClientError::Config(_))
        ));
        assert!(supervisor_with_token(Some("token")).is_ok());
    }

    #[test]
    fn test_close_is_idempotent() {
        let supervisor = supervisor_with_token(Some("token")).unwrap();
        let watch = supervisor.established_watch();
        supervisor.close();
        supervisor.close();
        assert!(supervisor.cancellation_token().is_cancelled());
        assert!(!*watch.borrow());
    }

    #[test]
    fn test_principal_resolution() {
        let mut supervisor = supervisor_with_token(Some("token")).unwrap();
        assert_eq!(supervisor.principal(), "anonymous");
        supervisor.client_id = Some("c42".to_string());
        assert_eq!(supervisor.principal(), "c42");
        supervisor.config.tenant.id = Some("t1".to_string());
        assert_eq!(supervisor.principal(), "t1");
    }

    #[test]
    fn test_jittered_backoff_stays_in_band() {
        let backoff = Duration::from_secs(10);
        for _ in 0..100 {
            let spread = jittered(backoff);
            assert!(spread >= Duration::from_secs(9));
            assert!(spread <= Duration::from_secs(11));
        }
    }

    #[test]
    fn test_classify_handshake_error() {
        let fatal = classify_handshake_error(ProtocolError::Server {
            code: "invalid_token".to_string(),
            message: "bad".to_string(),
            retry_after: None,
        });
        assert!(matches!(fatal, ClientError::AuthFatal { .. }));

        let transient = classify_handshake_error(ProtocolError::Server {
            code: "server_unavailable".to_string(),
            message: "busy".to_string(),
            retry_after: None,
        });
        assert!(matches!(transient, ClientError::Protocol(_)));
    }
}
