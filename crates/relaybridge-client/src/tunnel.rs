//! Tunnel manager: tracks tunnel declarations on the live session.
//!
//! The manager holds a handle to the session's command channel for the send
//! path; the byte-copy loops that move payload are external collaborators
//! and report transfers through [`TunnelManager::record_transfer`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

use relaybridge_protocol::TunnelInfo;

use crate::error::{ClientError, ClientResult};
use crate::metrics;
use crate::session::SessionCommand;

/// Payload direction for byte accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local listener → relay
    ToServer,
    /// Relay → local listener
    FromServer,
}

impl Direction {
    /// Metrics label
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ToServer => "to_server",
            Self::FromServer => "from_server",
        }
    }
}

/// Tunnel lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    /// Serving traffic
    Active,
    /// Closed locally or the session ended
    Inactive,
    /// Failed
    Error,
}

/// One tunnel declaration and its counters
#[derive(Debug, Clone, Serialize)]
pub struct Tunnel {
    /// Server-assigned identity, unique per session
    pub tunnel_id: String,
    /// Local listening port
    pub local_port: u16,
    /// Remote endpoint host
    pub remote_host: String,
    /// Remote endpoint port
    pub remote_port: u16,
    /// Payload protocol
    pub protocol: String,
    /// When the server confirmed the tunnel
    pub created_at: SystemTime,
    /// Last payload transfer
    pub last_activity: SystemTime,
    /// Payload bytes local → relay
    pub bytes_to_server: u64,
    /// Payload bytes relay → local
    pub bytes_from_server: u64,
    /// Lifecycle state
    pub status: TunnelStatus,
    /// Relay-side public port, if allocated
    pub public_port: Option<u16>,
}

#[derive(Debug, Default)]
struct Inner {
    tunnels: RwLock<HashMap<String, Tunnel>>,
    session: RwLock<Option<mpsc::Sender<SessionCommand>>>,
}

/// Tracks tunnels and brokers create/close against the live session
#[derive(Debug, Clone)]
pub struct TunnelManager {
    inner: Arc<Inner>,
    request_timeout: Duration,
}

impl TunnelManager {
    /// Create a manager; `request_timeout` bounds each tunnel request
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner::default()),
            request_timeout,
        }
    }

    /// Attach the live session's command channel
    pub(crate) fn bind_session(&self, sender: mpsc::Sender<SessionCommand>) {
        *self.inner.session.write() = Some(sender);
    }

    /// Detach the session and mark every tunnel inactive
    pub(crate) fn unbind_session(&self) {
        *self.inner.session.write() = None;
        let mut tunnels = self.inner.tunnels.write();
        for tunnel in tunnels.values_mut() {
            tunnel.status = TunnelStatus::Inactive;
        }
    }

    /// Declare a tunnel on the live session and wait for the relay's verdict.
    ///
    /// The returned tunnel carries the server-assigned `tunnel_id`, which is
    /// unique within the session.
    pub async fn create(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
        tunnel_id: Option<String>,
    ) -> ClientResult<Tunnel> {
        let sender = self
            .inner
            .session
            .read()
            .clone()
            .ok_or(ClientError::NotConnected)?;

        let proposed_id = tunnel_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let request = TunnelInfo {
            tunnel_id: proposed_id,
            local_port,
            remote_host: remote_host.to_string(),
            remote_port,
            protocol: Some("tcp".to_string()),
            options: None,
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(SessionCommand::OpenTunnel {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ClientError::NotConnected)?;

        let response = match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Err(_) => {
                metrics::record_tunnel_created("timeout");
                return Err(ClientError::Timeout);
            }
            Ok(Err(_)) => {
                metrics::record_tunnel_created("failed");
                return Err(ClientError::NotConnected);
            }
            Ok(Ok(Err(e))) => {
                metrics::record_tunnel_created("failed");
                return Err(e);
            }
            Ok(Ok(Ok(response))) => response,
        };

        if !response.is_success() {
            metrics::record_tunnel_created("failed");
            return Err(ClientError::TunnelRejected(response.status));
        }

        let now = SystemTime::now();
        let tunnel = Tunnel {
            tunnel_id: response.tunnel_id.clone(),
            local_port,
            remote_host: remote_host.to_string(),
            remote_port,
            protocol: "tcp".to_string(),
            created_at: now,
            last_activity: now,
            bytes_to_server: 0,
            bytes_from_server: 0,
            status: TunnelStatus::Active,
            public_port: response.public_port,
        };

        let mut tunnels = self.inner.tunnels.write();
        if tunnels.contains_key(&response.tunnel_id) {
            metrics::record_tunnel_created("failed");
            return Err(ClientError::TunnelRejected(format!(
                "duplicate tunnel id {}",
                response.tunnel_id
            )));
        }
        tunnels.insert(response.tunnel_id.clone(), tunnel.clone());
        drop(tunnels);

        info!(
            tunnel_id = %tunnel.tunnel_id,
            local_port,
            remote = %format!("{remote_host}:{remote_port}"),
            public_port = ?tunnel.public_port,
            "tunnel established"
        );
        metrics::record_tunnel_created("success");
        Ok(tunnel)
    }

    /// Mark a tunnel inactive and release its local resources
    pub fn close(&self, tunnel_id: &str) -> bool {
        let mut tunnels = self.inner.tunnels.write();
        match tunnels.get_mut(tunnel_id) {
            Some(tunnel) => {
                tunnel.status = TunnelStatus::Inactive;
                debug!(tunnel_id, "tunnel closed");
                true
            }
            None => false,
        }
    }

    /// Snapshot one tunnel
    pub fn get_status(&self, tunnel_id: &str) -> Option<Tunnel> {
        self.inner.tunnels.read().get(tunnel_id).cloned()
    }

    /// Snapshot all tunnels
    pub fn list(&self) -> Vec<Tunnel> {
        self.inner.tunnels.read().values().cloned().collect()
    }

    /// Whether no tunnels have ever been declared
    pub fn is_empty(&self) -> bool {
        self.inner.tunnels.read().is_empty()
    }

    /// Number of tunnels currently serving traffic
    pub fn active_count(&self) -> usize {
        self.inner
            .tunnels
            .read()
            .values()
            .filter(|t| t.status == TunnelStatus::Active)
            .count()
    }

    /// Account payload moved by an external byte-copy loop
    pub fn record_transfer(&self, tunnel_id: &str, direction: Direction, bytes: u64) {
        let mut tunnels = self.inner.tunnels.write();
        if let Some(tunnel) = tunnels.get_mut(tunnel_id) {
            match direction {
                Direction::ToServer => tunnel.bytes_to_server += bytes,
                Direction::FromServer => tunnel.bytes_from_server += bytes,
            }
            tunnel.last_activity = SystemTime::now();
            drop(tunnels);
            metrics::record_tunnel_bytes(tunnel_id, direction, bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use relaybridge_protocol::TunnelResponse;

    use super::*;

    fn manager() -> TunnelManager {
        TunnelManager::new(Duration::from_secs(1))
    }

    /// Answers every OpenTunnel command with the given response
    fn spawn_session_stub(
        manager: &TunnelManager,
        respond: impl Fn(&TunnelInfo) -> TunnelResponse + Send + 'static,
    ) {
        let (tx, mut rx) = mpsc::channel(4);
        manager.bind_session(tx);
        tokio::spawn(async move {
            while let Some(SessionCommand::OpenTunnel { request, reply }) = rx.recv().await {
                let _ = reply.send(Ok(respond(&request)));
            }
        });
    }

    #[tokio::test]
    async fn test_create_uses_server_assigned_id() {
        let manager = manager();
        spawn_session_stub(&manager, |request| TunnelResponse {
            status: "ok".to_string(),
            tunnel_id: request.tunnel_id.clone(),
            public_port: Some(31000),
            endpoint: None,
        });

        let tunnel = manager
            .create(8080, "db.internal", 5432, Some("tun-1".to_string()))
            .await
            .unwrap();
        assert_eq!(tunnel.tunnel_id, "tun-1");
        assert_eq!(tunnel.public_port, Some(31000));
        assert_eq!(tunnel.status, TunnelStatus::Active);
        assert_eq!(manager.active_count(), 1);

        let snapshot = manager.get_status("tun-1").unwrap();
        assert_eq!(snapshot.local_port, 8080);
        assert_eq!(snapshot.remote_host, "db.internal");
    }

    #[tokio::test]
    async fn test_create_without_session() {
        let manager = manager();
        let err = manager.create(8080, "db", 5432, None).await.unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }

    #[tokio::test]
    async fn test_rejected_tunnel_does_not_register() {
        let manager = manager();
        spawn_session_stub(&manager, |request| TunnelResponse {
            status: "error".to_string(),
            tunnel_id: request.tunnel_id.clone(),
            public_port: None,
            endpoint: None,
        });

        let err = manager.create(8080, "db", 5432, None).await.unwrap_err();
        assert!(matches!(err, ClientError::TunnelRejected(_)));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_close_marks_inactive() {
        let manager = manager();
        spawn_session_stub(&manager, |request| TunnelResponse {
            status: "ok".to_string(),
            tunnel_id: request.tunnel_id.clone(),
            public_port: None,
            endpoint: None,
        });

        manager
            .create(8080, "db", 5432, Some("tun-1".to_string()))
            .await
            .unwrap();
        assert!(manager.close("tun-1"));
        assert_eq!(manager.active_count(), 0);
        assert_eq!(
            manager.get_status("tun-1").unwrap().status,
            TunnelStatus::Inactive
        );
        assert!(!manager.close("missing"));
    }

    #[tokio::test]
    async fn test_unbind_marks_all_inactive() {
        let manager = manager();
        spawn_session_stub(&manager, |request| TunnelResponse {
            status: "ok".to_string(),
            tunnel_id: request.tunnel_id.clone(),
            public_port: None,
            endpoint: None,
        });
        manager.create(8080, "db", 5432, None).await.unwrap();

        manager.unbind_session();
        assert_eq!(manager.active_count(), 0);
        let err = manager.create(8081, "db", 5432, None).await.unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }

    #[tokio::test]
    async fn test_transfer_accounting() {
        let manager = manager();
        spawn_session_stub(&manager, |request| TunnelResponse {
            status: "ok".to_string(),
            tunnel_id: request.tunnel_id.clone(),
            public_port: None,
            endpoint: None,
        });
        manager
            .create(8080, "db", 5432, Some("tun-1".to_string()))
            .await
            .unwrap();

        manager.record_transfer("tun-1", Direction::ToServer, 1024);
        manager.record_transfer("tun-1", Direction::FromServer, 4096);
        let tunnel = manager.get_status("tun-1").unwrap();
        assert_eq!(tunnel.bytes_to_server, 1024);
        assert_eq!(tunnel.bytes_from_server, 4096);
    }
}
