//! TLS material loading and handshake handling for the HTTPS endpoint
//!
//! The certificate chain and private key are read from PEM files once,
//! before any listener is opened. A failure here is a startup error.
//!
//! Per-connection handshake failures are logged and only close the
//! offending connection.

use axum_server::accept::Accept;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use futures::future::BoxFuture;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::warn;

/// Errors that can occur during TLS setup
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Failed to read {kind} file '{path}': {source}")]
    Read {
        kind: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse {kind} file '{path}': {reason}")]
    Parse {
        kind: &'static str,
        path: PathBuf,
        reason: String,
    },

    #[error("No certificates found in '{0}'")]
    NoCertificates(PathBuf),

    #[error("No private key found in '{0}'")]
    NoPrivateKey(PathBuf),

    #[error("Failed to build TLS config: {0}")]
    Config(#[from] rustls::Error),
}

fn read_pem(kind: &'static str, path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|source| TlsError::Read {
        kind,
        path: path.to_path_buf(),
        source,
    })
}

/// Build a rustls ServerConfig from PEM certificate and key files
///
/// The certificate file may hold a full chain (leaf first). The key file
/// may hold a PKCS#8, PKCS#1 or SEC1 private key.
pub fn load_server_config(
    cert_path: &Path,
    key_path: &Path,
) -> Result<Arc<rustls::ServerConfig>, TlsError> {
    use rustls::pki_types::CertificateDer;
    use rustls_pemfile::{certs, private_key};
    use std::io::BufReader;

    let cert_pem = read_pem("certificate", cert_path)?;
    let key_pem = read_pem("private key", key_path)?;

    // Parse server certificate chain
    let cert_chain: Vec<CertificateDer<'static>> = certs(&mut BufReader::new(cert_pem.as_slice()))
        .collect::<Result<_, _>>()
        .map_err(|e| TlsError::Parse {
            kind: "certificate",
            path: cert_path.to_path_buf(),
            reason: e.to_string(),
        })?;

    if cert_chain.is_empty() {
        return Err(TlsError::NoCertificates(cert_path.to_path_buf()));
    }

    // Parse private key
    let key = private_key(&mut BufReader::new(key_pem.as_slice()))
        .map_err(|e| TlsError::Parse {
            kind: "private key",
            path: key_path.to_path_buf(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(key_path.to_path_buf()))?;

    // Build rustls config with ring crypto provider
    let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(cert_chain, key)?;

    // HTTP/1.1 only
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// TLS acceptor that logs failed handshakes
///
/// Wraps the axum-server rustls acceptor. A failed handshake drops only
/// that connection; the accept loop keeps running.
#[derive(Clone)]
pub struct LoggingTlsAcceptor {
    inner: RustlsAcceptor,
}

impl LoggingTlsAcceptor {
    pub fn new(config: Arc<rustls::ServerConfig>) -> Self {
        Self {
            inner: RustlsAcceptor::new(RustlsConfig::from_config(config)),
        }
    }
}

impl<S> Accept<TcpStream, S> for LoggingTlsAcceptor
where
    RustlsAcceptor: Accept<TcpStream, S>,
    <RustlsAcceptor as Accept<TcpStream, S>>::Future: Send + 'static,
{
    type Stream = <RustlsAcceptor as Accept<TcpStream, S>>::Stream;
    type Service = <RustlsAcceptor as Accept<TcpStream, S>>::Service;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: TcpStream, service: S) -> Self::Future {
        let peer = stream.peer_addr().ok();
        let handshake = self.inner.accept(stream, service);

        Box::pin(async move {
            handshake.await.inspect_err(|e| {
                warn!(peer = ?peer, error = %e, "TLS handshake failed, closing connection");
            })
        })
    }
}
