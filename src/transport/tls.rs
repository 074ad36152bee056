//! TLS material loading: certificate/key parsing via `rustls-pemfile` into
//! a `rustls::ServerConfig`/`ClientConfig` pair, mirroring how the teacher's
//! `networking::security` module loads PEM material for its own listener.

use crate::error::{AgentError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::io::BufReader;
use std::sync::Arc;

pub struct TlsMaterial {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub ca: Vec<CertificateDer<'static>>,
}

impl TlsMaterial {
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8], ca_pem: &[u8]) -> Result<Self> {
        let certs = rustls_pemfile::certs(&mut BufReader::new(cert_pem))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AgentError::Config(format!("invalid cert pem: {e}")))?;

        let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem))
            .map_err(|e| AgentError::Config(format!("invalid key pem: {e}")))?
            .ok_or_else(|| AgentError::Config("no private key found in pem".to_string()))?;

        let ca = rustls_pemfile::certs(&mut BufReader::new(ca_pem))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AgentError::Config(format!("invalid ca pem: {e}")))?;

        Ok(Self { certs, key, ca })
    }
}

/// Build a mutual-TLS server config: clients must present a certificate
/// signed by the cluster CA (spec §6: "agent-to-agent traffic is always
/// mutually authenticated when `verify_incoming`/`verify_outgoing` are
/// set").
pub fn load_server_config(material: TlsMaterial) -> Result<Arc<ServerConfig>> {
    let mut roots = RootCertStore::empty();
    for cert in &material.ca {
        roots
            .add(cert.clone())
            .map_err(|e| AgentError::Config(format!("invalid ca certificate: {e}")))?;
    }
    let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| AgentError::Config(format!("failed to build client verifier: {e}")))?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(material.certs, material.key)
        .map_err(|e| AgentError::Config(format!("invalid server tls config: {e}")))?;

    Ok(Arc::new(config))
}

pub fn load_client_config(material: TlsMaterial) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    for cert in &material.ca {
        roots
            .add(cert.clone())
            .map_err(|e| AgentError::Config(format!("invalid ca certificate: {e}")))?;
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(material.certs, material.key)
        .map_err(|e| AgentError::Config(format!("invalid client tls config: {e}")))?;

    Ok(Arc::new(config))
}
