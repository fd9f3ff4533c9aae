//! QUIC transport: quinn endpoint, TLS 1.3, a single bidirectional stream
//! carrying the line-delimited control frames. Additional streams are left
//! to tunnel payload, which is outside the control plane.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use quinn::crypto::rustls::QuicClientConfig;
use quinn::{IdleTimeout, VarInt};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use relaybridge_protocol::FrameCodec;

use crate::core::{Transport, TransportError, TransportKind, TransportResult, TransportState};
use crate::tls::{self, TlsOptions};

/// ALPN identifier for the control channel
pub const ALPN: &[u8] = b"relaybridge/1";

/// QUIC tuning knobs
#[derive(Debug, Clone)]
pub struct QuicOptions {
    /// Connection idle timeout
    pub max_idle_timeout: Duration,
    /// Maximum concurrent bidirectional streams
    pub max_concurrent_streams: u32,
    /// Keep-alive interval
    pub keep_alive_interval: Duration,
    /// Deadline for the QUIC+TLS handshake
    pub handshake_timeout: Duration,
}

impl Default for QuicOptions {
    fn default() -> Self {
        Self {
            max_idle_timeout: Duration::from_secs(60),
            max_concurrent_streams: 100,
            keep_alive_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// QUIC control transport
#[derive(Debug)]
pub struct QuicTransport {
    host: String,
    port: u16,
    tls: TlsOptions,
    options: QuicOptions,
    endpoint: Option<quinn::Endpoint>,
    connection: Option<quinn::Connection>,
    writer: Option<FramedWrite<quinn::SendStream, FrameCodec>>,
    reader: Option<FramedRead<quinn::RecvStream, FrameCodec>>,
    state: TransportState,
}

impl QuicTransport {
    /// Create a disconnected QUIC transport
    pub fn new(host: impl Into<String>, port: u16, tls: &TlsOptions, options: QuicOptions) -> Self {
        Self {
            host: host.into(),
            port,
            tls: tls.clone(),
            options,
            endpoint: None,
            connection: None,
            writer: None,
            reader: None,
            state: TransportState::Disconnected,
        }
    }

    fn client_config(&self) -> TransportResult<quinn::ClientConfig> {
        let tls_config = tls::client_config(&self.tls, &[ALPN])?;
        let crypto = QuicClientConfig::try_from(tls_config)
            .map_err(|e| TransportError::Tls(format!("QUIC crypto config: {e}")))?;
        let mut config = quinn::ClientConfig::new(Arc::new(crypto));

        let mut transport = quinn::TransportConfig::default();
        transport.max_idle_timeout(Some(
            IdleTimeout::try_from(self.options.max_idle_timeout)
                .map_err(|e| TransportError::Configuration(format!("idle timeout: {e}")))?,
        ));
        transport.keep_alive_interval(Some(self.options.keep_alive_interval));
        transport.max_concurrent_bidi_streams(VarInt::from_u32(self.options.max_concurrent_streams));
        config.transport_config(Arc::new(transport));
        Ok(config)
    }

    fn teardown(&mut self, reason: impl Into<String>) {
        self.writer = None;
        self.reader = None;
        self.connection = None;
        self.endpoint = None;
        self.state = TransportState::Failed {
            reason: reason.into(),
        };
    }
}

#[async_trait::async_trait]
impl Transport for QuicTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Quic
    }

    fn endpoint(&self) -> String {
        format!("quic://{}:{}", self.host, self.port)
    }

    async fn connect(
        &mut self,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> TransportResult<()> {
        self.state = TransportState::Connecting;
        let config = self.client_config()?;

        let addr = resolve(&self.host, self.port).await?;
        let bind: SocketAddr = if addr.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let mut endpoint = quinn::Endpoint::client(bind)
            .map_err(|e| TransportError::ConnectFailed(format!("bind UDP socket: {e}")))?;
        endpoint.set_default_client_config(config);

        let handshake_deadline = deadline.min(self.options.handshake_timeout);
        let connecting = endpoint
            .connect(addr, &self.host)
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let connection = tokio::select! {
            () = cancel.cancelled() => {
                self.state = TransportState::Disconnected;
                return Err(TransportError::Cancelled);
            }
            result = tokio::time::timeout(handshake_deadline, connecting) => {
                match result {
                    Err(_) => {
                        self.teardown("QUIC handshake deadline exceeded");
                        return Err(TransportError::Timeout);
                    }
                    Ok(Err(e)) => {
                        self.teardown(format!("QUIC handshake: {e}"));
                        return Err(TransportError::ConnectFailed(e.to_string()));
                    }
                    Ok(Ok(connection)) => connection,
                }
            }
        };

        let open = connection.open_bi();
        let (send, recv) = tokio::select! {
            () = cancel.cancelled() => {
                connection.close(VarInt::from_u32(0), b"cancelled");
                self.state = TransportState::Disconnected;
                return Err(TransportError::Cancelled);
            }
            result = tokio::time::timeout(handshake_deadline, open) => {
                match result {
                    Err(_) => {
                        self.teardown("control stream open deadline exceeded");
                        return Err(TransportError::Timeout);
                    }
                    Ok(Err(e)) => {
                        self.teardown(format!("open control stream: {e}"));
                        return Err(TransportError::ConnectFailed(e.to_string()));
                    }
                    Ok(Ok(pair)) => pair,
                }
            }
        };

        debug!(endpoint = %self.endpoint(), "QUIC transport connected");
        self.writer = Some(FramedWrite::new(send, FrameCodec::new()));
        self.reader = Some(FramedRead::new(recv, FrameCodec::new()));
        self.connection = Some(connection);
        self.endpoint = Some(endpoint);
        self.state = TransportState::Connected;
        Ok(())
    }

    async fn send(&mut self, frame: Bytes) -> TransportResult<()> {
        let writer = self.writer.as_mut().ok_or(TransportError::NotConnected)?;
        match writer.send(frame).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let msg = e.to_string();
                self.teardown(msg.clone());
                Err(TransportError::SendFailed(msg))
            }
        }
    }

    async fn recv(&mut self) -> TransportResult<Bytes> {
        let reader = self.reader.as_mut().ok_or(TransportError::NotConnected)?;
        match reader.next().await {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(e)) => {
                let msg = e.to_string();
                self.teardown(msg.clone());
                Err(TransportError::Frame(msg))
            }
            None => {
                self.teardown("control stream closed by peer");
                Err(TransportError::ReceiveFailed(
                    "control stream closed by peer".to_string(),
                ))
            }
        }
    }

    async fn ping(&mut self) -> TransportResult<Duration> {
        match &self.connection {
            Some(connection) => Ok(connection.rtt()),
            None => Err(TransportError::NotConnected),
        }
    }

    async fn close(&mut self) -> TransportResult<()> {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.close().await;
        }
        self.reader = None;
        if let Some(connection) = self.connection.take() {
            connection.close(VarInt::from_u32(0), b"client closed");
        }
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.wait_idle().await;
        }
        self.state = TransportState::Disconnected;
        Ok(())
    }

    fn state(&self) -> TransportState {
        self.state.clone()
    }
}

async fn resolve(host: &str, port: u16) -> TransportResult<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| TransportError::ConnectFailed(format!("resolve {host}: {e}")))?
        .next()
        .ok_or_else(|| TransportError::ConnectFailed(format!("no address for {host}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_match_contract() {
        let options = QuicOptions::default();
        assert_eq!(options.max_idle_timeout, Duration::from_secs(60));
        assert_eq!(options.max_concurrent_streams, 100);
        assert_eq!(options.keep_alive_interval, Duration::from_secs(30));
        assert_eq!(options.handshake_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_disconnected_state() {
        let transport = QuicTransport::new(
            "relay.example.com",
            8443,
            &TlsOptions::disabled(),
            QuicOptions::default(),
        );
        assert_eq!(transport.kind(), TransportKind::Quic);
        assert_eq!(transport.endpoint(), "quic://relay.example.com:8443");
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_resolve_loopback() {
        let addr = resolve("127.0.0.1", 4433).await.unwrap();
        assert_eq!(addr.port(), 4433);
        assert!(addr.ip().is_loopback());
    }
}
