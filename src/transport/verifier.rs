//! Server certificate verifiers.
//!
//! Both verifiers capture the presented leaf certificate so the engine
//! can hash it for crypto binding and surface it to the host when path
//! validation fails.

use std::sync::{Arc, Mutex};

use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::client::WebPkiServerVerifier;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
    CertificateError, DigitallySignedStruct, Error as TlsError, SignatureScheme,
};

/// Shared slot holding the leaf certificate presented by the server.
#[derive(Clone, Default)]
pub struct LeafCapture {
    inner: Arc<Mutex<Option<Vec<u8>>>>,
}

impl LeafCapture {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self, leaf: &CertificateDer<'_>) {
        *self.inner.lock().unwrap() = Some(leaf.as_ref().to_vec());
    }

    /// The captured leaf in DER form, if the server presented one.
    pub fn take(&self) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().clone()
    }
}

impl std::fmt::Debug for LeafCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LeafCapture")
    }
}

/// Verifier that validates the chain with webpki but checks the peer
/// name against the configured hostname rather than whatever name was
/// sent in the client hello (the two differ under a custom SNI).
#[derive(Debug)]
pub struct HostPinnedVerifier {
    inner: Arc<WebPkiServerVerifier>,
    expected: ServerName<'static>,
    verify_host: bool,
    capture: LeafCapture,
}

impl HostPinnedVerifier {
    pub fn new(
        inner: Arc<WebPkiServerVerifier>,
        expected: ServerName<'static>,
        verify_host: bool,
        capture: LeafCapture,
    ) -> Self {
        Self {
            inner,
            expected,
            verify_host,
            capture,
        }
    }
}

impl ServerCertVerifier for HostPinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        self.capture.store(end_entity);

        if !self.verify_host {
            // Chain validation only; name checking is disabled. Running
            // the inner verifier against the expected name and mapping
            // name errors away would mask chain errors, so validate
            // against the expected name and strip name mismatches.
            return match self.inner.verify_server_cert(
                end_entity,
                intermediates,
                &self.expected,
                ocsp_response,
                now,
            ) {
                Ok(verified) => Ok(verified),
                Err(TlsError::InvalidCertificate(
                    CertificateError::NotValidForName
                    | CertificateError::NotValidForNameContext { .. },
                )) => Ok(ServerCertVerified::assertion()),
                Err(e) => Err(e),
            };
        }

        self.inner.verify_server_cert(
            end_entity,
            intermediates,
            &self.expected,
            ocsp_response,
            now,
        )
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// A verifier that accepts any certificate. Used when host verification
/// is disabled and no custom trust is configured; the leaf is still
/// captured for crypto binding.
#[derive(Debug)]
pub struct AcceptAnyVerifier {
    capture: LeafCapture,
}

impl AcceptAnyVerifier {
    pub fn new(capture: LeafCapture) -> Self {
        Self { capture }
    }
}

impl ServerCertVerifier for AcceptAnyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        self.capture.store(end_entity);
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
