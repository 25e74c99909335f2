//! TLS material for both sides of the relay.
//!
//! The listener side loads a static PEM certificate chain and private key.
//! The backend side builds a client configuration that either verifies the
//! backend against the webpki roots or skips verification entirely, which
//! lets the relay talk to backends with self-signed certificates.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};

use crate::error::ProxyError;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Read every PEM certificate in `path`.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let read_err = |source: std::io::Error| ProxyError::ReadPem {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = BufReader::new(File::open(path).map_err(read_err)?);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(read_err)?;

    if certs.is_empty() {
        return Err(ProxyError::NoCertificates {
            path: path.to_path_buf(),
        });
    }

    Ok(certs)
}

/// Read the first PEM private key (PKCS#1, PKCS#8 or SEC1) in `path`.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ProxyError> {
    let read_err = |source: std::io::Error| ProxyError::ReadPem {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = BufReader::new(File::open(path).map_err(read_err)?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(read_err)?
        .ok_or_else(|| ProxyError::NoPrivateKey {
            path: path.to_path_buf(),
        })
}

/// Build the listener's server configuration from a certificate chain and a
/// private key on disk.
pub fn server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>, ProxyError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(Arc::new(config))
}

/// Build the client configuration used for `wss://` backend connections.
///
/// With `verify_certificate == false` any certificate the backend presents is
/// accepted.
pub fn client_config(verify_certificate: bool) -> Result<Arc<ClientConfig>, ProxyError> {
    let provider = provider();
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    let config = if verify_certificate {
        let roots: RootCertStore = webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect();
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipVerify { provider }))
            .with_no_client_auth()
    };

    Ok(Arc::new(config))
}

/// Accepts any server certificate. Handshake signatures are still checked so
/// the session keys belong to whoever presented the certificate.
#[derive(Debug)]
struct SkipVerify {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for SkipVerify {
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
        verify_tls12_signature(
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
        verify_tls13_signature(
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

    fn self_signed(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn loads_self_signed_pair() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = self_signed(dir.path());

        assert_eq!(load_certs(&cert_path).unwrap().len(), 1);
        assert!(load_private_key(&key_path).is_ok());
        assert!(server_config(&cert_path, &key_path).is_ok());
    }

    #[test]
    fn missing_certificate_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.pem");

        let err = load_certs(&missing).unwrap_err();
        match err {
            ProxyError::ReadPem { path, .. } => assert_eq!(path, missing),
            other => panic!("expected ReadPem, got {other:?}"),
        }
    }

    #[test]
    fn key_file_without_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, _) = self_signed(dir.path());

        // A certificate-only file holds no private key.
        let err = load_private_key(&cert_path).unwrap_err();
        assert!(matches!(err, ProxyError::NoPrivateKey { .. }));
    }

    #[test]
    fn cert_file_without_certs_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (_, key_path) = self_signed(dir.path());

        let err = load_certs(&key_path).unwrap_err();
        assert!(matches!(err, ProxyError::NoCertificates { .. }));
        assert!(err.to_string().contains("key.pem"));
    }

    #[test]
    fn client_config_builds_in_both_modes() {
        assert!(client_config(false).is_ok());
        assert!(client_config(true).is_ok());
    }
}
