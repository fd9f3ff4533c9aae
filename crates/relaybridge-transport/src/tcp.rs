//! TCP transport: newline-delimited control frames written directly on the
//! stream, optionally wrapped in TLS. This is the canonical transport for
//! compatibility mode.

use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use relaybridge_protocol::FrameCodec;

use crate::core::{Transport, TransportError, TransportKind, TransportResult, TransportState};
use crate::tls::{self, TlsOptions};

/// Socket or TLS-wrapped socket, erased behind the I/O traits
trait IoStream: AsyncRead + AsyncWrite + Unpin + Send + std::fmt::Debug {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + std::fmt::Debug> IoStream for T {}

/// Line-delimited TCP transport
#[derive(Debug)]
pub struct TcpTransport {
    host: String,
    port: u16,
    tls: TlsOptions,
    framed: Option<Framed<Box<dyn IoStream>, FrameCodec>>,
    state: TransportState,
}

impl TcpTransport {
    /// Create a disconnected TCP transport
    pub fn new(host: impl Into<String>, port: u16, tls: &TlsOptions) -> Self {
        Self {
            host: host.into(),
            port,
            tls: tls.clone(),
            framed: None,
            state: TransportState::Disconnected,
        }
    }

    fn fail(&mut self, reason: impl Into<String>) {
        self.framed = None;
        self.state = TransportState::Failed {
            reason: reason.into(),
        };
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http1
    }

    fn endpoint(&self) -> String {
        let scheme = if self.tls.enabled { "tcps" } else { "tcp" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    async fn connect(
        &mut self,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> TransportResult<()> {
        self.state = TransportState::Connecting;

        let host = self.host.clone();
        let port = self.port;
        let dial = TcpStream::connect((host, port));
        let stream = tokio::select! {
            () = cancel.cancelled() => {
                self.state = TransportState::Disconnected;
                return Err(TransportError::Cancelled);
            }
            result = tokio::time::timeout(deadline, dial) => {
                match result {
                    Err(_) => {
                        self.fail("connect deadline exceeded");
                        return Err(TransportError::Timeout);
                    }
                    Ok(Err(e)) => {
                        self.fail(format!("connect: {e}"));
                        return Err(TransportError::ConnectFailed(e.to_string()));
                    }
                    Ok(Ok(stream)) => stream,
                }
            }
        };
        let _ = stream.set_nodelay(true);

        let io: Box<dyn IoStream> = if self.tls.enabled {
            let config = tls::client_config(&self.tls, &[])?;
            let connector = TlsConnector::from(std::sync::Arc::new(config));
            let name = tls::server_name(&self.host)?;
            let handshake = connector.connect(name, stream);
            let tls_stream = tokio::select! {
                () = cancel.cancelled() => {
                    self.state = TransportState::Disconnected;
                    return Err(TransportError::Cancelled);
                }
                result = tokio::time::timeout(deadline, handshake) => {
                    match result {
                        Err(_) => {
                            self.fail("TLS handshake deadline exceeded");
                            return Err(TransportError::Timeout);
                        }
                        Ok(Err(e)) => {
                            self.fail(format!("TLS handshake: {e}"));
                            return Err(TransportError::Tls(e.to_string()));
                        }
                        Ok(Ok(s)) => s,
                    }
                }
            };
            Box::new(tls_stream)
        } else {
            Box::new(stream)
        };

        debug!(endpoint = %self.endpoint(), "TCP transport connected");
        self.framed = Some(Framed::new(io, FrameCodec::new()));
        self.state = TransportState::Connected;
        Ok(())
    }

    async fn send(&mut self, frame: Bytes) -> TransportResult<()> {
        let framed = self.framed.as_mut().ok_or(TransportError::NotConnected)?;
        match framed.send(frame).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let msg = e.to_string();
                self.fail(msg.clone());
                Err(TransportError::SendFailed(msg))
            }
        }
    }

    async fn recv(&mut self) -> TransportResult<Bytes> {
        let framed = self.framed.as_mut().ok_or(TransportError::NotConnected)?;
        match framed.next().await {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(e)) => {
                let msg = e.to_string();
                self.fail(msg.clone());
                Err(TransportError::Frame(msg))
            }
            None => {
                self.fail("connection closed by peer");
                Err(TransportError::ReceiveFailed(
                    "connection closed by peer".to_string(),
                ))
            }
        }
    }

    async fn ping(&mut self) -> TransportResult<Duration> {
        if self.is_connected() {
            // Liveness on a raw stream is the socket itself; the control
            // plane's heartbeat measures real round trips.
            Ok(Duration::ZERO)
        } else {
            Err(TransportError::NotConnected)
        }
    }

    async fn close(&mut self) -> TransportResult<()> {
        if let Some(mut framed) = self.framed.take() {
            let _ = framed.close().await;
        }
        self.state = TransportState::Disconnected;
        Ok(())
    }

    fn state(&self) -> TransportState {
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tokio::net::TcpListener;
    use tokio_util::codec::{Framed, LinesCodec};

    use super::*;

    #[tokio::test]
    async fn test_connect_send_recv_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, LinesCodec::new());
            let line = framed.next().await.unwrap().unwrap();
            assert_eq!(line, r#"{"type":"heartbeat"}"#);
            SinkExt::send(&mut framed, r#"{"type":"heartbeat_response"}"#.to_string())
                .await
                .unwrap();
        });

        let mut transport = TcpTransport::new("127.0.0.1", port, &TlsOptions::disabled());
        transport
            .connect(Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert!(transport.is_connected());

        transport
            .send(Bytes::from_static(br#"{"type":"heartbeat"}"#))
            .await
            .unwrap();
        let frame = transport.recv().await.unwrap();
        assert_eq!(&frame[..], br#"{"type":"heartbeat_response"}"#);

        transport.close().await.unwrap();
        assert!(!transport.is_connected());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 1 on localhost is essentially never listening
        let mut transport = TcpTransport::new("127.0.0.1", 1, &TlsOptions::disabled());
        let err = transport
            .connect(Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::ConnectFailed(_) | TransportError::Timeout
        ));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_connect_honours_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        // 203.0.113.0/24 is TEST-NET-3; the dial blocks long enough for the
        // already-cancelled token to win the race.
        let mut transport = TcpTransport::new("203.0.113.1", 9, &TlsOptions::disabled());
        let err = transport
            .connect(Duration::from_secs(30), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_peer_close_is_receive_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let mut transport = TcpTransport::new("127.0.0.1", port, &TlsOptions::disabled());
        transport
            .connect(Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        let err = transport.recv().await.unwrap_err();
        assert!(matches!(err, TransportError::ReceiveFailed(_)));
        assert!(matches!(transport.state(), TransportState::Failed { .. }));
    }

    #[tokio::test]
    async fn test_send_before_connect() {
        let mut transport = TcpTransport::new("127.0.0.1", 4000, &TlsOptions::disabled());
        let err = transport.send(Bytes::from_static(b"{}")).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }
}
