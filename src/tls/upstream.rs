use super::CaError;
use crate::config::UpstreamConfig;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Client config used by tunnels to reach the real upstream.
pub fn client_config(config: &UpstreamConfig) -> Result<Arc<ClientConfig>, CaError> {
    let mut tls = if config.accept_invalid_certs {
        warn!("Upstream certificate verification is disabled");
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        for path in &config.extra_root_certs {
            let added = add_pem_roots(&mut roots, path)?;
            info!(path = %path.display(), certs = added, "Trusting extra upstream roots");
        }
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    tls.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(tls))
}

/// Client config trusting exactly the given roots.
pub fn client_config_with_roots(
    roots: impl IntoIterator<Item = CertificateDer<'static>>,
) -> Result<Arc<ClientConfig>, CaError> {
    let mut store = RootCertStore::empty();
    for cert in roots {
        store
            .add(cert)
            .map_err(|e| CaError::Init(format!("invalid root certificate: {e}")))?;
    }
    let mut tls = ClientConfig::builder()
        .with_root_certificates(store)
        .with_no_client_auth();
    tls.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(tls))
}

fn add_pem_roots(roots: &mut RootCertStore, path: &Path) -> Result<usize, CaError> {
    let pem = std::fs::read(path)?;
    let mut added = 0;
    for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
        let cert = cert.map_err(|e| CaError::Init(format!("{}: {e}", path.display())))?;
        roots
            .add(cert)
            .map_err(|e| CaError::Init(format!("{}: {e}", path.display())))?;
        added += 1;
    }
    Ok(added)
}

#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::{CaSettings, CertificateAuthority};
    use tempfile::TempDir;

    #[test]
    fn test_default_config_uses_http1_alpn() {
        let tls = client_config(&UpstreamConfig::default()).unwrap();
        assert_eq!(tls.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_extra_roots_are_loaded() {
        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::generate(&CaSettings::new("extra-root")).unwrap();
        let path = dir.path().join("extra.pem");
        std::fs::write(&path, ca.root_pem()).unwrap();

        let mut roots = RootCertStore::empty();
        assert_eq!(add_pem_roots(&mut roots, &path).unwrap(), 1);
        assert_eq!(roots.len(), 1);

        let config = UpstreamConfig {
            extra_root_certs: vec![path],
            ..UpstreamConfig::default()
        };
        assert!(client_config(&config).is_ok());
    }

    #[test]
    fn test_missing_extra_root_is_an_error() {
        let config = UpstreamConfig {
            extra_root_certs: vec!["/nonexistent/root.pem".into()],
            ..UpstreamConfig::default()
        };
        assert!(client_config(&config).is_err());
    }
}
