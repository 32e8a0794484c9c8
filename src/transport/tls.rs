//! TLS connector configuration.
//!
//! Mirrors `ssl_CertificateOptions` (§6): a certificate-options object
//! supplied by the caller, with a sensible default (native root store)
//! when omitted. Grounded in the rustls connector pattern from
//! `grpcurl-rs`'s `connection.rs`.

use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;

/// TLS client configuration. Certificate/key *loading* is out of scope
/// (an external collaborator per §1); this only shapes the rustls
/// `ClientConfig` built from caller-supplied material.
pub struct TlsOptions {
    extra_roots: Vec<CertificateDer<'static>>,
    insecure: bool,
}

impl Default for TlsOptions {
    fn default() -> Self {
        TlsOptions {
            extra_roots: Vec::new(),
            insecure: false,
        }
    }
}

impl TlsOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust an additional root certificate, in DER form, on top of the
    /// platform's native trust store.
    pub fn with_root(mut self, root: CertificateDer<'static>) -> Self {
        self.extra_roots.push(root);
        self
    }

    /// Trust every certificate found in a PEM-encoded bundle, on top of
    /// the platform's native trust store.
    pub fn with_root_pem(mut self, pem: &[u8]) -> Result<Self, crate::error::RpcError> {
        for cert in rustls_pemfile::certs(&mut std::io::Cursor::new(pem)) {
            let cert = cert.map_err(|e| crate::error::RpcError::Connection(e.to_string()))?;
            self.extra_roots.push(cert);
        }
        Ok(self)
    }

    /// Skip server certificate verification entirely. Test/dev only.
    pub fn insecure() -> Self {
        TlsOptions {
            extra_roots: Vec::new(),
            insecure: true,
        }
    }

    pub fn build_client_config(&self) -> Result<Arc<ClientConfig>, crate::error::RpcError> {
        if self.insecure {
            return Ok(Arc::new(
                ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                    .with_safe_default_protocol_versions()
                    .map_err(|e| crate::error::RpcError::Connection(e.to_string()))?
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoVerifier))
                    .with_no_client_auth(),
            ));
        }

        let mut roots = RootCertStore::empty();
        for cert in rustls_native_certs::load_native_certs().certs {
            let _ = roots.add(cert);
        }
        for root in &self.extra_roots {
            let _ = roots.add(root.clone());
        }

        let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| crate::error::RpcError::Connection(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Arc::new(config))
    }
}

#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_root_pem_accepts_an_empty_bundle() {
        let opts = TlsOptions::new().with_root_pem(b"").unwrap();
        assert!(opts.extra_roots.is_empty());
    }

    #[test]
    fn with_root_pem_loads_every_certificate_in_a_multi_cert_bundle() {
        // Two syntactically well-formed (if not cryptographically
        // meaningful) PEM blocks back to back, verifying both are parsed
        // rather than just the first.
        let pem = concat!(
            "-----BEGIN CERTIFICATE-----\n",
            "MAA=\n",
            "-----END CERTIFICATE-----\n",
            "-----BEGIN CERTIFICATE-----\n",
            "MAA=\n",
            "-----END CERTIFICATE-----\n",
        );
        let opts = TlsOptions::new().with_root_pem(pem.as_bytes()).unwrap();
        assert_eq!(opts.extra_roots.len(), 2);
    }
}
