//! TLS material for the QUIC transport: a self-signed server certificate and
//! a client verifier for development peers.

use rsm_core::{Result, RsmError};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::sync::{Arc, Once};

/// ALPN protocol identifier negotiated by both sides
pub const ALPN: &[u8] = b"rsocket";
/// Server name the client presents
pub const SERVER_NAME: &str = "localhost";

static CRYPTO_PROVIDER: Once = Once::new();

/// Install the ring provider as the process default, once
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Generate self-signed certificate for QUIC
pub fn generate_self_signed_cert() -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()])
        .map_err(|e| RsmError::bind_failed(format!("certificate generation: {}", e)))?;
    let key_der = cert.key_pair.serialize_der();
    let cert_der = cert.cert.der().clone();

    let key = PrivateKeyDer::try_from(key_der)
        .map_err(|e| RsmError::bind_failed(format!("private key: {}", e)))?;
    Ok((vec![cert_der], key))
}

pub fn server_config() -> Result<rustls::ServerConfig> {
    ensure_crypto_provider();
    let (certs, key) = generate_self_signed_cert()?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| RsmError::bind_failed(format!("tls config: {}", e)))?;
    config.alpn_protocols = vec![ALPN.to_vec()];

    Ok(config)
}

pub fn client_config() -> rustls::ClientConfig {
    ensure_crypto_provider();
    let mut config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(SkipServerVerification::new())
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN.to_vec()];

    config
}

// Accepts any server certificate; peers use throwaway self-signed certs
#[derive(Debug)]
struct SkipServerVerification;

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
