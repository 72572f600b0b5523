//! TLS plumbing: an ephemeral self-signed certificate for the server side
//! (spec §4.6: "TLS is required, self-signed cert acceptable") and a
//! verifier on the client side that accepts any certificate. Trust between
//! nodes in this fabric is established by the application-level
//! authentication handshake (spec §4.7), not by a PKI chain, so skipping
//! certificate verification here doesn't widen the trust boundary.

use std::sync::Arc;

use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};

pub fn ensure_crypto_provider() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Generates a fresh self-signed certificate/key pair for `localhost` and
/// any IP SANs the caller wants covered.
pub fn generate_self_signed(subject_alt_names: Vec<String>) -> (CertificateDer<'static>, rustls::pki_types::PrivateKeyDer<'static>) {
    let cert = rcgen::generate_simple_self_signed(subject_alt_names).expect("self-signed cert generation");
    let cert_der = CertificateDer::from(cert.cert.der().to_vec());
    let key_der = rustls::pki_types::PrivateKeyDer::try_from(cert.signing_key.serialize_der()).expect("DER private key");
    (cert_der, key_der)
}

pub fn server_config(subject_alt_names: Vec<String>) -> quinn::ServerConfig {
    ensure_crypto_provider();
    let (cert, key) = generate_self_signed(subject_alt_names);
    let mut server_crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .expect("valid self-signed server cert");
    server_crypto.alpn_protocols = vec![b"tunnox-v1".to_vec()];

    let quic_crypto = QuicServerConfig::try_from(server_crypto).expect("rustls config is quic-compatible");
    quinn::ServerConfig::with_crypto(Arc::new(quic_crypto))
}

pub fn client_config() -> quinn::ClientConfig {
    ensure_crypto_provider();
    let mut client_crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    client_crypto.alpn_protocols = vec![b"tunnox-v1".to_vec()];

    let quic_crypto = QuicClientConfig::try_from(client_crypto).expect("rustls config is quic-compatible");
    quinn::ClientConfig::new(Arc::new(quic_crypto))
}

#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
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
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}
