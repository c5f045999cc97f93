//! TLS Configuration
//!
//! Builds rustls configurations for the RPC listener and for outbound peer
//! connections from PEM files. When a CA file is given the listener requires
//! client certificates signed by it (mutual TLS).

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// TLS setup errors.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no private key found in {0}")]
    MissingKey(String),
    #[error("no certificates found in {0}")]
    MissingCertificate(String),
    #[error("{0} is required")]
    MissingFile(&'static str),
    #[error("invalid server name {0:?}")]
    InvalidServerName(String),
    #[error("client verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
    #[error("rustls: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Paths to the PEM material for one side of a connection.
#[derive(Debug, Clone, Default)]
pub struct TlsFiles {
    /// Certificate chain presented to the other side
    pub cert_file: Option<PathBuf>,
    /// Private key for `cert_file`
    pub key_file: Option<PathBuf>,
    /// CA used to verify the other side
    pub ca_file: Option<PathBuf>,
    /// Name expected in the server certificate (peer side only)
    pub server_name: String,
}

impl TlsFiles {
    /// Build the listener-side configuration.
    pub fn server_config(&self) -> Result<ServerTlsConfig, TlsError> {
        let cert_file = self.cert_file.as_deref().ok_or(TlsError::MissingFile("cert_file"))?;
        let key_file = self.key_file.as_deref().ok_or(TlsError::MissingFile("key_file"))?;
        let certs = load_certs(cert_file)?;
        let key = load_key(key_file)?;

        let builder = rustls::ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?;

        let config = match &self.ca_file {
            Some(ca_file) => {
                let verifier = WebPkiClientVerifier::builder_with_provider(
                    Arc::new(load_roots(ca_file)?),
                    provider(),
                )
                .build()?;
                builder
                    .with_client_cert_verifier(verifier)
                    .with_single_cert(certs, key)?
            }
            None => builder.with_no_client_auth().with_single_cert(certs, key)?,
        };

        Ok(ServerTlsConfig {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }

    /// Build the configuration used to dial peers.
    pub fn peer_config(&self) -> Result<PeerTlsConfig, TlsError> {
        let ca_file = self.ca_file.as_deref().ok_or(TlsError::MissingFile("ca_file"))?;
        let roots = load_roots(ca_file)?;

        let builder = rustls::ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots);

        let config = match (&self.cert_file, &self.key_file) {
            (Some(cert_file), Some(key_file)) => {
                builder.with_client_auth_cert(load_certs(cert_file)?, load_key(key_file)?)?
            }
            _ => builder.with_no_client_auth(),
        };

        let server_name = ServerName::try_from(self.server_name.clone())
            .map_err(|_| TlsError::InvalidServerName(self.server_name.clone()))?;

        Ok(PeerTlsConfig {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }
}

/// Listener-side TLS.
#[derive(Clone)]
pub struct ServerTlsConfig {
    acceptor: TlsAcceptor,
}

impl ServerTlsConfig {
    pub fn acceptor(&self) -> &TlsAcceptor {
        &self.acceptor
    }
}

impl std::fmt::Debug for ServerTlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTlsConfig").finish_non_exhaustive()
    }
}

/// Dial-side TLS for peer connections.
#[derive(Clone)]
pub struct PeerTlsConfig {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl PeerTlsConfig {
    pub fn connector(&self) -> &TlsConnector {
        &self.connector
    }

    pub fn server_name(&self) -> ServerName<'static> {
        self.server_name.clone()
    }
}

impl std::fmt::Debug for PeerTlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerTlsConfig")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// Common name of a certificate's subject, if it has one.
pub fn certificate_subject(cert: &CertificateDer<'_>) -> Option<String> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref()).ok()?;
    let common_name = parsed.subject().iter_common_name().next()?;
    common_name.as_str().ok().map(str::to_string)
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path).map(BufReader::new).map_err(|source| TlsError::Read {
        path: path.display().to_string(),
        source,
    })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: path.display().to_string(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::MissingCertificate(path.display().to_string()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|source| TlsError::Read {
            path: path.display().to_string(),
            source,
        })?
        .ok_or_else(|| TlsError::MissingKey(path.display().to_string()))
}

fn load_roots(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}
