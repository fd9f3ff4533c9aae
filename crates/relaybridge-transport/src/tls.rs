//! Shared TLS client configuration.
//!
//! One policy serves all three transports: minimum TLS 1.2 (1.3 preferred),
//! a configured CA bundle or the system roots, an optional client identity,
//! and a single development-only environment knob that disables certificate
//! verification when set to the literal `"true"`.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::warn;

use crate::core::{TransportError, TransportResult};

/// Environment knob disabling certificate verification. Development only.
pub const INSECURE_SKIP_VERIFY_ENV: &str = "RELAYBRIDGE_INSECURE_SKIP_VERIFY";

/// TLS settings shared by every transport
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Wrap the TCP transport in TLS. QUIC and HTTP/2 always use TLS.
    pub enabled: bool,
    /// Client certificate chain, PEM
    pub cert_file: Option<PathBuf>,
    /// Client private key, PEM
    pub key_file: Option<PathBuf>,
    /// Trust root bundle, PEM; system roots when unset
    pub ca_file: Option<PathBuf>,
    /// Minimum protocol version, `"1.2"` (default) or `"1.3"`
    pub min_version: Option<String>,
}

impl TlsOptions {
    /// Options with TLS off for the TCP transport
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Whether the development knob disables certificate verification
    pub fn insecure_skip_verify() -> bool {
        std::env::var(INSECURE_SKIP_VERIFY_ENV).as_deref() == Ok("true")
    }

    /// Whether a client identity is configured
    pub fn has_client_identity(&self) -> bool {
        self.cert_file.is_some() && self.key_file.is_some()
    }
}

/// Build a rustls client configuration from the options.
///
/// `alpn` is the protocol list to advertise; empty for the TCP transport.
pub fn client_config(opts: &TlsOptions, alpn: &[&[u8]]) -> TransportResult<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

    let versions: &[&rustls::SupportedProtocolVersion] = match opts.min_version.as_deref() {
        Some("1.3") => &[&rustls::version::TLS13],
        _ => &[&rustls::version::TLS13, &rustls::version::TLS12],
    };

    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(versions)
        .map_err(|e| TransportError::Tls(format!("protocol versions: {e}")))?;

    let builder = if TlsOptions::insecure_skip_verify() {
        warn!("TLS certificate verification is DISABLED ({INSECURE_SKIP_VERIFY_ENV}=true)");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier { provider }))
    } else {
        builder.with_root_certificates(root_store(opts.ca_file.as_deref())?)
    };

    let mut config = match (&opts.cert_file, &opts.key_file) {
        (Some(cert_file), Some(key_file)) => {
            let certs = load_certs(cert_file)?;
            let key = load_key(key_file)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| TransportError::Tls(format!("client identity: {e}")))?
        }
        _ => builder.with_no_client_auth(),
    };

    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

fn root_store(ca_file: Option<&Path>) -> TransportResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    match ca_file {
        Some(path) => {
            for cert in load_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|e| TransportError::Tls(format!("CA bundle {}: {e}", path.display())))?;
            }
        }
        None => {
            let loaded = rustls_native_certs::load_native_certs();
            for cert in loaded.certs {
                // Individual unparsable platform certs are skipped, same as
                // every other rustls consumer does.
                let _ = roots.add(cert);
            }
            if roots.is_empty() {
                return Err(TransportError::Tls(format!(
                    "no usable system trust roots ({} load errors)",
                    loaded.errors.len()
                )));
            }
        }
    }
    Ok(roots)
}

fn load_certs(path: &Path) -> TransportResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| TransportError::Tls(format!("open {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("parse {}: {e}", path.display())))
}

fn load_key(path: &Path) -> TransportResult<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| TransportError::Tls(format!("open {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::Tls(format!("parse {}: {e}", path.display())))?
        .ok_or_else(|| TransportError::Tls(format!("no private key in {}", path.display())))
}

/// Parse a host string into a TLS server name
pub fn server_name(host: &str) -> TransportResult<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| TransportError::Tls(format!("invalid server name {host:?}: {e}")))
}

/// Accepts any server certificate. Installed only behind the environment
/// knob; signatures are still checked so a broken handshake fails loudly.
#[derive(Debug)]
struct InsecureVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insecure_knob_requires_literal_true() {
        // Only the literal "true" may disable verification
        std::env::remove_var(INSECURE_SKIP_VERIFY_ENV);
        assert!(!TlsOptions::insecure_skip_verify());
        std::env::set_var(INSECURE_SKIP_VERIFY_ENV, "1");
        assert!(!TlsOptions::insecure_skip_verify());
        std::env::set_var(INSECURE_SKIP_VERIFY_ENV, "TRUE");
        assert!(!TlsOptions::insecure_skip_verify());
        std::env::set_var(INSECURE_SKIP_VERIFY_ENV, "true");
        assert!(TlsOptions::insecure_skip_verify());
        std::env::remove_var(INSECURE_SKIP_VERIFY_ENV);
    }

    #[test]
    fn test_client_identity_requires_both_halves() {
        let mut opts = TlsOptions::disabled();
        assert!(!opts.has_client_identity());
        opts.cert_file = Some(PathBuf::from("client.pem"));
        assert!(!opts.has_client_identity());
        opts.key_file = Some(PathBuf::from("client.key"));
        assert!(opts.has_client_identity());
    }

    #[test]
    fn test_missing_ca_bundle_is_a_tls_error() {
        let err = root_store(Some(Path::new("/nonexistent/bundle.pem"))).unwrap_err();
        assert!(matches!(err, TransportError::Tls(_)));
    }

    #[test]
    fn test_server_name_rejects_garbage() {
        assert!(server_name("relay.example.com").is_ok());
        assert!(server_name("not a hostname").is_err());
    }
}
