//! TLS Roles
//!
//! Server and client TLS setup for mutually-authenticated relay legs. Both
//! roles trust the same CA file; the server optionally demands a client
//! certificate and exposes the peer's common name for logging.
//!
//! All certificate material is loaded eagerly so that a missing file is a
//! startup failure rather than a per-connection one.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::TlsStream;
use tracing::debug;

use crate::config::TlsConfig;

/// TLS-specific errors
#[derive(Error, Debug)]
pub enum TlsError {
    /// A required certificate, key or CA file does not exist
    #[error("Required TLS file not found: {}", path.display())]
    MissingFile { path: PathBuf },

    /// Failed to load certificate from file
    #[error("Failed to load certificate from {}: {reason}", path.display())]
    CertificateLoad { path: PathBuf, reason: String },

    /// Failed to load private key from file
    #[error("Failed to load private key from {}: {reason}", path.display())]
    PrivateKeyLoad { path: PathBuf, reason: String },

    /// TLS handshake failed
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// TLS configuration error
    #[error("TLS configuration error: {0}")]
    Config(String),
}

impl TlsError {
    pub fn cert_load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        TlsError::CertificateLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn key_load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        TlsError::PrivateKeyLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn handshake(reason: impl Into<String>) -> Self {
        TlsError::Handshake(reason.into())
    }

    pub fn config(reason: impl Into<String>) -> Self {
        TlsError::Config(reason.into())
    }
}

fn require_file(path: &Path) -> Result<(), TlsError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(TlsError::MissingFile {
            path: path.to_path_buf(),
        })
    }
}

/// Load certificates from a PEM file
pub(crate) fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    require_file(path)?;
    let file = File::open(path).map_err(|e| TlsError::cert_load(path, e.to_string()))?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::cert_load(path, e.to_string()))?;

    if certs.is_empty() {
        return Err(TlsError::cert_load(path, "no certificates found in file"));
    }

    Ok(certs)
}

/// Load a private key (RSA, PKCS8 or EC) from a PEM file
pub(crate) fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    require_file(path)?;
    let file = File::open(path).map_err(|e| TlsError::key_load(path, e.to_string()))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::key_load(path, e.to_string()))?
        .ok_or_else(|| TlsError::key_load(path, "no private key found in file"))
}

fn load_root_store(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut store = RootCertStore::empty();
    for cert in load_certificates(path)? {
        store
            .add(cert)
            .map_err(|e| TlsError::cert_load(path, e.to_string()))?;
    }
    Ok(store)
}

/// Server-side TLS: accepts relay clients, optionally requiring a client certificate
#[derive(Clone)]
pub struct TlsAcceptor {
    inner: tokio_rustls::TlsAcceptor,
}

impl TlsAcceptor {
    /// Build the acceptor from the configured certificate directory
    pub fn new(config: &TlsConfig) -> Result<Self, TlsError> {
        let certs = load_certificates(&config.server_cert_path())?;
        let key = load_private_key(&config.server_key_path())?;
        let roots = Arc::new(load_root_store(&config.ca_path())?);

        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let verifier_builder =
            WebPkiClientVerifier::builder_with_provider(roots, Arc::clone(&provider));
        let verifier = if config.require_client_cert {
            verifier_builder.build()
        } else {
            verifier_builder.allow_unauthenticated().build()
        }
        .map_err(|e| TlsError::config(format!("Failed to build client verifier: {}", e)))?;

        let server_config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::config(format!("Failed to set protocol versions: {}", e)))?
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|e| TlsError::config(format!("Failed to build TLS config: {}", e)))?;

        Ok(Self {
            inner: tokio_rustls::TlsAcceptor::from(Arc::new(server_config)),
        })
    }

    /// Perform the server-side handshake
    pub async fn accept(&self, stream: TcpStream) -> Result<TlsStream<TcpStream>, TlsError> {
        let tls = self
            .inner
            .accept(stream)
            .await
            .map_err(|e| TlsError::handshake(e.to_string()))?;
        Ok(TlsStream::Server(tls))
    }
}

/// Client-side TLS: dials relay servers presenting our own certificate
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    /// Build the connector from the configured certificate directory
    pub fn new(config: &TlsConfig) -> Result<Self, TlsError> {
        let certs = load_certificates(&config.client_cert_path())?;
        let key = load_private_key(&config.client_key_path())?;
        let roots = load_root_store(&config.ca_path())?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let client_config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::config(format!("Failed to set protocol versions: {}", e)))?
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(|e| TlsError::config(format!("Failed to build client TLS config: {}", e)))?;

        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(client_config)),
        })
    }

    /// Perform the client-side handshake, verifying the server as `server_name`
    pub async fn connect(
        &self,
        stream: TcpStream,
        server_name: &str,
    ) -> Result<TlsStream<TcpStream>, TlsError> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TlsError::config(format!("Invalid server name: {}", server_name)))?;

        let tls = self
            .inner
            .connect(name, stream)
            .await
            .map_err(|e| TlsError::handshake(e.to_string()))?;
        Ok(TlsStream::Client(tls))
    }
}

/// Common name from the peer's leaf certificate, if it presented one
pub fn peer_common_name(stream: &TlsStream<TcpStream>) -> Option<String> {
    let (_, common) = stream.get_ref();
    let leaf = common.peer_certificates()?.first()?;

    match x509_parser::parse_x509_certificate(leaf.as_ref()) {
        Ok((_, cert)) => cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string),
        Err(e) => {
            debug!("Could not parse peer certificate: {}", e);
            None
        }
    }
}
