//! TLS configuration utilities
//!
//! Server side loads a PEM certificate chain and key; client side trusts the
//! webpki roots or a single CA bundle.

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use crate::error::{ProxyError, Result};

/// Create server TLS config from certificate and key files
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let cert_file = File::open(cert_path)?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_reader)
        .filter_map(|r| r.ok())
        .collect();

    if certs.is_empty() {
        return Err(ProxyError::Tls(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let key_file = File::open(key_path)?;
    let mut key_reader = BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| ProxyError::Tls(format!("no private key found in {}", key_path.display())))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    // Session tickets let reconnecting clients skip the full handshake.
    if let Ok(ticketer) = rustls::crypto::ring::Ticketer::new() {
        config.ticketer = ticketer;
    }

    Ok(Arc::new(config))
}

/// Create client TLS config, trusting `ca_path` when given and webpki roots otherwise
pub fn load_client_config(ca_path: Option<&Path>) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    match ca_path {
        Some(path) => {
            let mut reader = BufReader::new(File::open(path)?);
            for cert in rustls_pemfile::certs(&mut reader) {
                roots.add(cert?)?;
            }
            if roots.is_empty() {
                return Err(ProxyError::Tls(format!(
                    "no certificates found in {}",
                    path.display()
                )));
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Validate an SNI host name
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| ProxyError::Tls(format!("invalid server name {:?}: {}", host, e)))
}
