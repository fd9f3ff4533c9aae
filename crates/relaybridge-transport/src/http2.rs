//! HTTP/2 transport: control frames travel as request/response bodies over
//! a TLS-required HTTP/2 connection. Sends POST to `/data`, receives by
//! long-polling GET `/data`, and probes GET `/ping`. A server that
//! negotiates HTTP/1 over the same TLS connection is refused.

use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use relaybridge_protocol::MAX_FRAME_SIZE;

use crate::core::{Transport, TransportError, TransportKind, TransportResult, TransportState};
use crate::tls::TlsOptions;

/// Pause between empty long-poll rounds so a quiet server is not hammered
const POLL_BACKOFF: Duration = Duration::from_millis(50);

/// HTTP/2 request/response transport
#[derive(Debug)]
pub struct Http2Transport {
    base: String,
    tls: TlsOptions,
    client: Option<reqwest::Client>,
    state: TransportState,
}

impl Http2Transport {
    /// Create a disconnected HTTP/2 transport
    pub fn new(host: impl Into<String>, port: u16, tls: &TlsOptions) -> Self {
        Self {
            base: format!("https://{}:{}", host.into(), port),
            tls: tls.clone(),
            client: None,
            state: TransportState::Disconnected,
        }
    }

    fn url(&self, path: &str) -> TransportResult<Url> {
        Url::parse(&self.base)
            .and_then(|u| u.join(path))
            .map_err(|e| TransportError::Configuration(format!("endpoint URL: {e}")))
    }

    fn build_client(&self, connect_timeout: Duration) -> TransportResult<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .https_only(true)
            .connect_timeout(connect_timeout)
            .min_tls_version(match self.tls.min_version.as_deref() {
                Some("1.3") => reqwest::tls::Version::TLS_1_3,
                _ => reqwest::tls::Version::TLS_1_2,
            });

        if TlsOptions::insecure_skip_verify() {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(ca_file) = &self.tls.ca_file {
            let pem = std::fs::read(ca_file)
                .map_err(|e| TransportError::Tls(format!("open {}: {e}", ca_file.display())))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| TransportError::Tls(format!("parse {}: {e}", ca_file.display())))?;
            builder = builder.add_root_certificate(cert);
        }
        if let (Some(cert_file), Some(key_file)) = (&self.tls.cert_file, &self.tls.key_file) {
            let mut pem = std::fs::read(cert_file)
                .map_err(|e| TransportError::Tls(format!("open {}: {e}", cert_file.display())))?;
            pem.extend(
                std::fs::read(key_file)
                    .map_err(|e| TransportError::Tls(format!("open {}: {e}", key_file.display())))?,
            );
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| TransportError::Tls(format!("client identity: {e}")))?;
            builder = builder.identity(identity);
        }

        builder
            .build()
            .map_err(|e| TransportError::Configuration(e.to_string()))
    }

    /// The whole point of this transport: anything but HTTP/2 is refused
    fn require_h2(&mut self, response: &reqwest::Response) -> TransportResult<()> {
        if response.version() == reqwest::Version::HTTP_2 {
            Ok(())
        } else {
            let got = format!("{:?}", response.version());
            self.teardown(format!("server negotiated {got}"));
            Err(TransportError::Protocol(format!(
                "server negotiated {got} instead of HTTP/2"
            )))
        }
    }

    fn teardown(&mut self, reason: impl Into<String>) {
        self.client = None;
        self.state = TransportState::Failed {
            reason: reason.into(),
        };
    }
}

#[async_trait::async_trait]
impl Transport for Http2Transport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http2
    }

    fn endpoint(&self) -> String {
        self.base.clone()
    }

    async fn connect(
        &mut self,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> TransportResult<()> {
        self.state = TransportState::Connecting;
        let client = self.build_client(deadline)?;
        let health_url = self.url("/health")?;
        let probe = client.get(health_url).send();

        let response = tokio::select! {
            () = cancel.cancelled() => {
                self.state = TransportState::Disconnected;
                return Err(TransportError::Cancelled);
            }
            result = tokio::time::timeout(deadline, probe) => {
                match result {
                    Err(_) => {
                        self.teardown("connect deadline exceeded");
                        return Err(TransportError::Timeout);
                    }
                    Ok(Err(e)) => {
                        self.teardown(format!("connect: {e}"));
                        return Err(TransportError::ConnectFailed(e.to_string()));
                    }
                    Ok(Ok(response)) => response,
                }
            }
        };
        self.require_h2(&response)?;
        if !response.status().is_success() {
            let status = response.status();
            self.teardown(format!("health probe returned {status}"));
            return Err(TransportError::ConnectFailed(format!(
                "health probe returned {status}"
            )));
        }

        debug!(endpoint = %self.base, "HTTP/2 transport connected");
        self.client = Some(client);
        self.state = TransportState::Connected;
        Ok(())
    }

    async fn send(&mut self, frame: Bytes) -> TransportResult<()> {
        let url = self.url("/data")?;
        let client = self.client.clone().ok_or(TransportError::NotConnected)?;
        let response = client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(frame)
            .send()
            .await
            .map_err(|e| {
                self.teardown(format!("send: {e}"));
                TransportError::SendFailed(e.to_string())
            })?;
        self.require_h2(&response)?;
        if !response.status().is_success() {
            let status = response.status();
            self.teardown(format!("send returned {status}"));
            return Err(TransportError::SendFailed(format!(
                "server returned {status}"
            )));
        }
        Ok(())
    }

    async fn recv(&mut self) -> TransportResult<Bytes> {
        let url = self.url("/data")?;
        loop {
            let client = self.client.clone().ok_or(TransportError::NotConnected)?;
            let response = client.get(url.clone()).send().await.map_err(|e| {
                self.teardown(format!("receive: {e}"));
                TransportError::ReceiveFailed(e.to_string())
            })?;
            self.require_h2(&response)?;

            match response.status() {
                status if status == reqwest::StatusCode::NO_CONTENT => {
                    tokio::time::sleep(POLL_BACKOFF).await;
                }
                status if status.is_success() => {
                    let body = response.bytes().await.map_err(|e| {
                        self.teardown(format!("receive body: {e}"));
                        TransportError::ReceiveFailed(e.to_string())
                    })?;
                    if body.is_empty() {
                        tokio::time::sleep(POLL_BACKOFF).await;
                        continue;
                    }
                    if body.len() > MAX_FRAME_SIZE {
                        self.teardown("oversize frame");
                        return Err(TransportError::Frame(format!(
                            "frame of {} bytes exceeds the maximum frame size",
                            body.len()
                        )));
                    }
                    return Ok(body);
                }
                status => {
                    self.teardown(format!("receive returned {status}"));
                    return Err(TransportError::ReceiveFailed(format!(
                        "server returned {status}"
                    )));
                }
            }
        }
    }

    async fn ping(&mut self) -> TransportResult<Duration> {
        let url = self.url("/ping")?;
        let client = self.client.clone().ok_or(TransportError::NotConnected)?;
        let started = Instant::now();
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;
        if response.status().is_success() {
            Ok(started.elapsed())
        } else {
            Err(TransportError::ReceiveFailed(format!(
                "ping returned {}",
                response.status()
            )))
        }
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.client = None;
        self.state = TransportState::Disconnected;
        Ok(())
    }

    fn state(&self) -> TransportState {
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_is_https() {
        let transport = Http2Transport::new("relay.example.com", 8443, &TlsOptions::disabled());
        assert_eq!(transport.endpoint(), "https://relay.example.com:8443");
        assert_eq!(transport.kind(), TransportKind::Http2);
    }

    #[test]
    fn test_url_join() {
        let transport = Http2Transport::new("relay.example.com", 8443, &TlsOptions::disabled());
        assert_eq!(
            transport.url("/data").unwrap().as_str(),
            "https://relay.example.com:8443/data"
        );
    }

    #[tokio::test]
    async fn test_send_before_connect() {
        let mut transport = Http2Transport::new("relay.example.com", 8443, &TlsOptions::disabled());
        let err = transport.send(Bytes::from_static(b"{}")).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }
}
