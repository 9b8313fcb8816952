//! rustls client configuration for the transport
//!
//! Two modes: strict chain + hostname verification against the webpki roots,
//! or skip-verify, which accepts any server certificate.

use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::ClientConfig;

use crate::error::{AutobidError, Result};

/// How the peer certificate is checked during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMode {
    #[default]
    Verify,
    SkipVerify,
}

impl TlsMode {
    pub fn from_skip_verify(skip_verify: bool) -> Self {
        if skip_verify {
            TlsMode::SkipVerify
        } else {
            TlsMode::Verify
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TlsMode::Verify => "verify",
            TlsMode::SkipVerify => "skip-verify",
        }
    }
}

/// Build the client config for `mode`.
///
/// The protocol floor is TLS 1.2; rustls does not implement older versions.
pub fn client_config(mode: TlsMode) -> Result<Arc<ClientConfig>> {
    let builder =
        ClientConfig::builder_with_provider(rustls::crypto::ring::default_provider().into())
            .with_safe_default_protocol_versions()
            .map_err(|e| AutobidError::Connect(format!("tls protocol version error: {}", e)))?;

    let config = match mode {
        TlsMode::Verify => {
            let mut root_store = rustls::RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder
                .with_root_certificates(root_store)
                .with_no_client_auth()
        }
        TlsMode::SkipVerify => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerifier))
            .with_no_client_auth(),
    };

    Ok(Arc::new(config))
}

/// SNI / verification name for `host`
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| AutobidError::Connect(format!("invalid tls server name '{}': {}", host, e)))
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    /// Accepts every certificate. Only reachable through `TlsMode::SkipVerify`.
    #[derive(Debug)]
    pub struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}
