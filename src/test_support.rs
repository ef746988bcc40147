//! Shared helpers for tests: certificates, clients, endpoint contexts

#![allow(clippy::unwrap_used, clippy::expect_used)]

use crate::config::ServerConfig;
use crate::server::endpoint::{fault_channel, EndpointContext, EndpointFault};
use crate::server::shutdown::{shutdown_channel, ShutdownController};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Self-signed certificate and key written to a temp dir
///
/// The directory is removed when this value is dropped.
pub struct TestCerts {
    pub dir: TempDir,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

pub fn self_signed_certs() -> TestCerts {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string(), "127.0.0.1".to_string()])
            .expect("Failed to generate self-signed certificate");

    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let cert_path = dir.path().join("tls.crt");
    let key_path = dir.path().join("tls.key");
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();

    TestCerts {
        dir,
        cert_path,
        key_path,
    }
}

/// Loopback address with an OS-assigned port
pub fn ephemeral_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
}

/// Config bound to loopback with ephemeral ports and short timeouts
pub fn test_config(name: &str, certs: &TestCerts) -> ServerConfig {
    let mut config = ServerConfig::new(name, &certs.cert_path, &certs.key_path);
    config.host = IpAddr::V4(Ipv4Addr::LOCALHOST);
    config.https_port = 0;
    config.grpc_port = 0;
    config.drain_period = Duration::from_millis(500);
    config.grpc_grace_period = Duration::from_millis(500);
    config.shutdown_timeout = Duration::from_secs(5);
    config
}

/// HTTPS client that trusts any certificate
pub fn https_client() -> reqwest::Client {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(Duration::from_secs(5))
        .build()
        .expect("Failed to build HTTPS client")
}

/// Endpoint context plus the handles a test needs to drive it
pub struct TestContext {
    pub ctx: EndpointContext,
    pub controller: ShutdownController,
    pub faults: mpsc::UnboundedReceiver<EndpointFault>,
}

pub fn test_context() -> TestContext {
    let (controller, shutdown) = shutdown_channel();
    let (reporter, faults) = fault_channel();
    TestContext {
        ctx: EndpointContext {
            shutdown,
            faults: reporter,
        },
        controller,
        faults,
    }
}

/// True once nothing accepts TCP connections on `addr`
pub async fn is_refusing(addr: SocketAddr) -> bool {
    tokio::net::TcpStream::connect(addr).await.is_err()
}
