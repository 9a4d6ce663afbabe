//! TLS material for WebSocket listeners.
//!
//! Every configured certificate/key pair is loaded at start. The certificate
//! for a handshake is chosen by SNI: the first pair whose certificate is valid
//! for the requested name, otherwise the first pair.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::ring::{default_provider, sign::any_supported_type};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use thiserror::Error;
use tracing::debug;

use crate::config::CertConfig;

/// Errors loading TLS material.
#[derive(Debug, Error)]
pub enum TlsError {
    /// File could not be opened or parsed as PEM.
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// PEM file holds no certificate.
    #[error("no certificate in {0}")]
    NoCertificate(PathBuf),

    /// PEM file holds no private key.
    #[error("no private key in {0}")]
    NoPrivateKey(PathBuf),

    /// Key type not supported by the crypto provider.
    #[error("unsupported private key in {path}: {source}")]
    UnsupportedKey {
        path: PathBuf,
        #[source]
        source: rustls::Error,
    },

    #[error("tls configuration: {0}")]
    Config(#[from] rustls::Error),
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
}

/// Load one certificate chain and its private key.
pub fn load_certified_key(pair: &CertConfig) -> Result<CertifiedKey, TlsError> {
    let certs = rustls_pemfile::certs(&mut open(&pair.certfile)?)
        .collect::<Result<Vec<CertificateDer<'static>>, _>>()
        .map_err(|source| TlsError::Read {
            path: pair.certfile.clone(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate(pair.certfile.clone()));
    }

    let key = rustls_pemfile::private_key(&mut open(&pair.keyfile)?)
        .map_err(|source| TlsError::Read {
            path: pair.keyfile.clone(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(pair.keyfile.clone()))?;

    let signing_key = any_supported_type(&key).map_err(|source| TlsError::UnsupportedKey {
        path: pair.keyfile.clone(),
        source,
    })?;

    Ok(CertifiedKey::new(certs, signing_key))
}

/// Picks a certificate by SNI.
#[derive(Debug)]
pub struct SniCertResolver {
    keys: Vec<Arc<CertifiedKey>>,
}

impl SniCertResolver {
    /// `keys` must not be empty.
    pub fn new(keys: Vec<Arc<CertifiedKey>>) -> Self {
        Self { keys }
    }

    /// Certificate to present for `server_name`.
    pub fn pick(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let matched = server_name
            .and_then(|name| ServerName::try_from(name).ok())
            .and_then(|name| self.keys.iter().find(|key| valid_for(key, &name)));

        matched.or_else(|| self.keys.first()).cloned()
    }
}

fn valid_for(key: &CertifiedKey, name: &ServerName<'_>) -> bool {
    let Ok(der) = key.end_entity_cert() else {
        return false;
    };
    webpki::EndEntityCert::try_from(der)
        .map(|cert| cert.verify_is_valid_for_subject_name(name).is_ok())
        .unwrap_or(false)
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name();
        debug!(sni = ?server_name, "Resolving certificate");
        self.pick(server_name)
    }
}

/// Build a server config presenting the given certificate pairs.
pub fn server_config(pairs: &[CertConfig]) -> Result<Arc<ServerConfig>, TlsError> {
    let keys = pairs
        .iter()
        .map(|pair| load_certified_key(pair).map(Arc::new))
        .collect::<Result<Vec<_>, _>>()?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniCertResolver::new(keys)));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_pair(dir: &TempDir, stem: &str, names: &[&str]) -> CertConfig {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let cert = rcgen::generate_simple_self_signed(names).unwrap();
        let certfile = dir.path().join(format!("{stem}.crt"));
        let keyfile = dir.path().join(format!("{stem}.key"));
        std::fs::write(&certfile, cert.cert.pem()).unwrap();
        std::fs::write(&keyfile, cert.key_pair.serialize_pem()).unwrap();
        CertConfig { certfile, keyfile }
    }

    #[test]
    fn test_pick_by_server_name() {
        let dir = TempDir::new().unwrap();
        let a = Arc::new(load_certified_key(&write_pair(&dir, "a", &["a.example"])).unwrap());
        let b = Arc::new(load_certified_key(&write_pair(&dir, "b", &["b.example"])).unwrap());
        let resolver = SniCertResolver::new(vec![Arc::clone(&a), Arc::clone(&b)]);

        assert!(Arc::ptr_eq(&resolver.pick(Some("b.example")).unwrap(), &b));
        assert!(Arc::ptr_eq(&resolver.pick(Some("a.example")).unwrap(), &a));
        // Unknown name and no SNI fall back to the first pair.
        assert!(Arc::ptr_eq(&resolver.pick(Some("c.example")).unwrap(), &a));
        assert!(Arc::ptr_eq(&resolver.pick(None).unwrap(), &a));
    }

    #[test]
    fn test_server_config_loads_pairs() {
        let dir = TempDir::new().unwrap();
        let pair = write_pair(&dir, "gate", &["localhost"]);
        let config = server_config(&[pair]).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let pair = CertConfig {
            certfile: dir.path().join("missing.crt"),
            keyfile: dir.path().join("missing.key"),
        };
        assert!(matches!(
            load_certified_key(&pair),
            Err(TlsError::Read { .. })
        ));
    }

    #[test]
    fn test_key_file_without_key() {
        let dir = TempDir::new().unwrap();
        let mut pair = write_pair(&dir, "gate", &["localhost"]);
        pair.keyfile = pair.certfile.clone();
        assert!(matches!(
            load_certified_key(&pair),
            Err(TlsError::NoPrivateKey(_))
        ));
    }

    #[test]
    fn test_cert_file_without_cert() {
        let dir = TempDir::new().unwrap();
        let mut pair = write_pair(&dir, "gate", &["localhost"]);
        pair.certfile = pair.keyfile.clone();
        assert!(matches!(
            load_certified_key(&pair),
            Err(TlsError::NoCertificate(_))
        ));
    }
}
