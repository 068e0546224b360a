//! TLS material for both halves.
//!
//! - Tunnel server: client certificates required and verified against the CA.
//!   TLS 1.2 is limited to ECDHE-ECDSA-AES128-GCM-SHA256.
//! - Stream server: client certificates requested but optional.
//! - Edge client: trusts the CA, presents the edge certificate.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tracing::debug;

use crate::error::{Result, TunnelError};
use crate::util::expand_tilde;

fn tls_err(e: impl std::fmt::Display) -> TunnelError {
    TunnelError::Tls(e.to_string())
}

/// Load a PEM certificate chain.
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let path = expand_tilde(path);
    let mut reader = BufReader::new(File::open(path.as_ref())?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<std::result::Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TunnelError::Tls(format!("no certificates found in {path}")));
    }
    debug!(path = %path, count = certs.len(), "loaded certificates");
    Ok(certs)
}

/// Load the first PEM private key (PKCS#8, PKCS#1 or SEC1).
pub fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let path = expand_tilde(path);
    let mut reader = BufReader::new(File::open(path.as_ref())?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| TunnelError::Tls(format!("no private key found in {path}")))
}

fn root_store(ca_path: &str) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_path)? {
        roots.add(cert).map_err(tls_err)?;
    }
    Ok(roots)
}

/// ring with the tunnel's suite preference: every TLS 1.3 suite plus the one
/// TLS 1.2 suite the edge PKI uses.
fn tunnel_provider() -> Arc<CryptoProvider> {
    Arc::new(CryptoProvider {
        cipher_suites: vec![
            ring::cipher_suite::TLS13_AES_128_GCM_SHA256,
            ring::cipher_suite::TLS13_AES_256_GCM_SHA384,
            ring::cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
            ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        ],
        ..ring::default_provider()
    })
}

/// Server config for the edge-facing tunnel listener.
pub fn tunnel_server_config(ca: &str, cert: &str, key: &str) -> Result<Arc<ServerConfig>> {
    let provider = tunnel_provider();
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(root_store(ca)?), provider.clone())
        .build()
        .map_err(tls_err)?;
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(tls_err)?
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(cert)?, load_private_key(key)?)
        .map_err(tls_err)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Server config for the API-server-facing stream listener.
pub fn stream_server_config(ca: &str, cert: &str, key: &str) -> Result<Arc<ServerConfig>> {
    let provider = Arc::new(ring::default_provider());
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(root_store(ca)?), provider.clone())
        .allow_unauthenticated()
        .build()
        .map_err(tls_err)?;
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(tls_err)?
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(cert)?, load_private_key(key)?)
        .map_err(tls_err)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Client config for the edge's tunnel connections.
pub fn edge_client_config(ca: &str, cert: &str, key: &str) -> Result<Arc<ClientConfig>> {
    let config = ClientConfig::builder_with_provider(tunnel_provider())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(tls_err)?
        .with_root_certificates(root_store(ca)?)
        .with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)
        .map_err(tls_err)?;
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str, content: &str) -> String {
        let path = std::env::temp_dir().join(format!("edgestream-tls-{}-{name}", std::process::id()));
        std::fs::write(&path, content).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = load_certs("/nonexistent/edgestream/ca.crt").unwrap_err();
        assert!(matches!(err, TunnelError::Io(_)));
    }

    #[test]
    fn test_file_without_certificates() {
        let path = temp_file("empty.crt", "not a pem file\n");
        let err = load_certs(&path).unwrap_err();
        assert!(err.to_string().contains("no certificates found"));
        let err = load_private_key(&path).unwrap_err();
        assert!(err.to_string().contains("no private key found"));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_tunnel_suites() {
        let provider = tunnel_provider();
        let tls12: Vec<_> = provider
            .cipher_suites
            .iter()
            .filter(|s| s.version().version == rustls::ProtocolVersion::TLSv1_2)
            .map(|s| s.suite())
            .collect();
        assert_eq!(tls12, vec![rustls::CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256]);
    }
}
