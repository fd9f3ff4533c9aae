//! Client-side handshake state machine.
//!
//! The exchange is `hello` (C→S), `hello` (S→C), `auth` (C→S),
//! `auth_response` (S→C). The machine is sans-I/O: [`Handshake::open`]
//! yields the first frame to send, and [`Handshake::on_message`] consumes
//! inbound frames and says what to do next. The caller moves frames.
//!
//! Version negotiation: the client adopts the server's version when it is
//! one this client speaks, otherwise the session fails with
//! `unsupported_version`. The effective feature set is the intersection of
//! both advertisements, in the client's order.

use serde_json::{Map, Value};

use crate::error::{ErrorClass, ProtocolError, classify_code};
use crate::messages::{
    Auth, AuthResponse, ClientInfo, ControlMessage, ErrorMessage, Hello, ProtocolVersion,
};

/// Session lifecycle from the client's perspective
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing sent yet
    Init,
    /// Client `hello` is on the wire
    SentHello,
    /// Server `hello` consumed, version adopted
    GotHello,
    /// Client `auth` is on the wire
    SentAuth,
    /// Handshake complete, session live
    Established,
    /// Terminal: the session failed
    Failed,
    /// Terminal: the session was closed
    Closed,
}

impl SessionState {
    /// Name used in diagnostics
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::SentHello => "sent_hello",
            Self::GotHello => "got_hello",
            Self::SentAuth => "sent_auth",
            Self::Established => "established",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }

    /// Whether the session accepts no further messages
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

/// What the handshake negotiated
#[derive(Debug, Clone)]
pub struct Negotiated {
    /// Effective protocol version
    pub version: ProtocolVersion,
    /// Effective feature set (intersection, client order)
    pub features: Vec<String>,
    /// Server-assigned client identity
    pub client_id: Option<String>,
    /// Server-assigned session identity
    pub session_id: Option<String>,
    /// Tenant this session authenticated as
    pub tenant_id: Option<String>,
    /// Permissions granted by the server
    pub permissions: Vec<String>,
    /// Account limits reported by the server
    pub limits: Map<String, Value>,
}

impl Negotiated {
    /// Whether a feature survived negotiation
    pub fn has_feature(&self, name: &str) -> bool {
        self.features.iter().any(|f| f == name)
    }
}

/// Inputs the handshake needs
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Version the client opens with
    pub version: ProtocolVersion,
    /// Features the client advertises; defaults to the version profile
    pub features: Option<Vec<String>>,
    /// Bearer token for `auth`
    pub token: String,
    /// Tenant identity, required for v2 multi-tenant operation
    pub tenant_id: Option<String>,
    /// Platform description, sent in v1 `auth`
    pub client_info: ClientInfo,
}

impl HandshakeConfig {
    fn advertised_features(&self) -> Vec<String> {
        self.features.clone().unwrap_or_else(|| {
            self.version
                .default_features()
                .iter()
                .map(|s| (*s).to_string())
                .collect()
        })
    }
}

/// Next action after consuming an inbound message
#[derive(Debug)]
pub enum Step {
    /// Write this frame to the peer
    Send(ControlMessage),
    /// Handshake complete
    Established(Box<Negotiated>),
    /// Nothing to do; keep reading
    Wait,
}

/// Drives a single session from `Init` to `Established`
#[derive(Debug)]
pub struct Handshake {
    config: HandshakeConfig,
    state: SessionState,
    negotiated_version: Option<ProtocolVersion>,
    negotiated_features: Vec<String>,
}

impl Handshake {
    /// Start a handshake for one connection attempt
    pub fn new(config: HandshakeConfig) -> Self {
        Self {
            config,
            state: SessionState::Init,
            negotiated_version: None,
            negotiated_features: Vec::new(),
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Produce the opening `hello`. Valid once, from `Init`.
    pub fn open(&mut self) -> Result<ControlMessage, ProtocolError> {
        if self.state != SessionState::Init {
            return Err(ProtocolError::UnexpectedMessage {
                message: "hello".to_string(),
                state: self.state.as_str().to_string(),
            });
        }
        self.state = SessionState::SentHello;
        Ok(ControlMessage::Hello(Hello {
            version: self.config.version.as_str().to_string(),
            features: self.config.advertised_features(),
        }))
    }

    /// Consume one inbound message and decide the next step
    pub fn on_message(&mut self, msg: ControlMessage) -> Result<Step, ProtocolError> {
        match msg {
            ControlMessage::Error(err) => self.on_error(err),
            ControlMessage::Unknown => Ok(Step::Wait),
            ControlMessage::Hello(hello) if self.state == SessionState::SentHello => {
                self.on_server_hello(hello)
            }
            ControlMessage::AuthResponse(resp) if self.state == SessionState::SentAuth => {
                self.on_auth_response(resp)
            }
            other => {
                let state = self.state;
                self.state = SessionState::Failed;
                Err(ProtocolError::UnexpectedMessage {
                    message: other.type_name().to_string(),
                    state: state.as_str().to_string(),
                })
            }
        }
    }

    fn on_server_hello(&mut self, hello: Hello) -> Result<Step, ProtocolError> {
        let Some(version) = ProtocolVersion::parse(&hello.version) else {
            self.state = SessionState::Failed;
            return Err(ProtocolError::UnsupportedVersion(hello.version));
        };

        let ours = self.config.advertised_features();
        self.negotiated_features = ours
            .into_iter()
            .filter(|f| hello.features.iter().any(|s| s == f))
            .collect();
        self.negotiated_version = Some(version);
        self.state = SessionState::GotHello;

        let auth = match version {
            ProtocolVersion::V1 => Auth {
                token: self.config.token.clone(),
                tenant_id: None,
                version: Some(version.as_str().to_string()),
                client_info: Some(self.config.client_info.clone()),
            },
            ProtocolVersion::V2 => Auth {
                token: self.config.token.clone(),
                tenant_id: self.config.tenant_id.clone(),
                version: None,
                client_info: None,
            },
        };
        self.state = SessionState::SentAuth;
        Ok(Step::Send(ControlMessage::Auth(auth)))
    }

    fn on_auth_response(&mut self, resp: AuthResponse) -> Result<Step, ProtocolError> {
        if !resp.is_success() {
            self.state = SessionState::Failed;
            return Err(ProtocolError::Server {
                code: "auth_rejected".to_string(),
                message: format!("authentication rejected with status {:?}", resp.status),
                retry_after: None,
            });
        }

        let version = self
            .negotiated_version
            .expect("auth_response only reachable after server hello");
        let tenant_id = match version {
            ProtocolVersion::V1 => None,
            ProtocolVersion::V2 => self.config.tenant_id.clone(),
        };
        self.state = SessionState::Established;
        Ok(Step::Established(Box::new(Negotiated {
            version,
            features: std::mem::take(&mut self.negotiated_features),
            client_id: resp.client_id,
            session_id: resp.session_id,
            tenant_id,
            permissions: resp.permissions,
            limits: resp.limits,
        })))
    }

    fn on_error(&mut self, err: ErrorMessage) -> Result<Step, ProtocolError> {
        if classify_code(&err.code) == ErrorClass::Advisory {
            return Ok(Step::Wait);
        }
        self.state = SessionState::Failed;
        Err(ProtocolError::Server {
            retry_after: err.retry_after(),
            code: err.code,
            message: err.message,
        })
    }
}
