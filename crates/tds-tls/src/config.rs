//! TLS trust configuration.

use std::sync::Arc;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::error::TlsError;

/// Trust settings for the session's TLS engine.
///
/// The defaults validate the server certificate against the bundled
/// web-PKI roots. `trust_server_certificate` disables validation
/// entirely and exists for test rigs and self-signed lab servers.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Accept whatever certificate the server presents.
    ///
    /// **Warning:** insecure; only for testing.
    pub trust_server_certificate: bool,

    /// Additional trust roots beyond the bundled web-PKI set.
    pub root_certificates: Vec<CertificateDer<'static>>,

    /// Name to validate the certificate against, when it differs from the
    /// host the socket connects to.
    pub server_name: Option<String>,
}

impl TlsOptions {
    /// Create default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Disable certificate validation.
    #[must_use]
    pub fn trust_server_certificate(mut self, trust: bool) -> Self {
        self.trust_server_certificate = trust;
        self
    }

    /// Add a trust root.
    #[must_use]
    pub fn add_root_certificate(mut self, cert: CertificateDer<'static>) -> Self {
        self.root_certificates.push(cert);
        self
    }

    /// Override the name used for certificate validation.
    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Build the rustls client configuration these options describe.
    pub fn build(&self) -> Result<Arc<ClientConfig>, TlsError> {
        let config = if self.trust_server_certificate {
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
                .with_no_client_auth()
        } else {
            let mut roots = RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };
            for cert in &self.root_certificates {
                roots
                    .add(cert.clone())
                    .map_err(|e| TlsError::InvalidRootCertificate(e.to_string()))?;
            }
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };
        Ok(Arc::new(config))
    }
}

/// Verifier that accepts any server certificate.
#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_options_build() {
        let options = TlsOptions::new();
        assert!(options.build().is_ok());
    }

    #[test]
    fn trusting_options_build() {
        let options = TlsOptions::new().trust_server_certificate(true);
        assert!(options.build().is_ok());
    }
}
