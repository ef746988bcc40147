//! Startup configuration
//!
//! Parsed once from the command line (plus the `ENABLE_GRPC_HEALTH`
//! environment toggle) and never mutated afterwards.

use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default HTTPS port
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// Default gRPC health port
pub const DEFAULT_GRPC_PORT: u16 = 9090;

/// Environment toggle for the gRPC health endpoint
pub const GRPC_TOGGLE_ENV: &str = "ENABLE_GRPC_HEALTH";

/// Command line arguments
#[derive(Debug, Clone, Parser)]
#[command(
    name = "webapp-fixture",
    version,
    about = "HTTPS and optional gRPC health backend fixture"
)]
pub struct Cli {
    /// Port to listen on (HTTPS)
    #[arg(long, default_value_t = DEFAULT_HTTPS_PORT)]
    pub port: u16,

    /// Path to the PEM certificate chain
    #[arg(long)]
    pub certfile: PathBuf,

    /// Path to the PEM private key
    #[arg(long)]
    pub keyfile: PathBuf,

    /// Name of the application, echoed in the greeting
    #[arg(long)]
    pub name: String,

    /// Port for the gRPC health server
    #[arg(long, default_value_t = DEFAULT_GRPC_PORT)]
    pub grpc_port: u16,

    /// Serve the gRPC health endpoint (also enabled by ENABLE_GRPC_HEALTH=1)
    #[arg(long)]
    pub enable_grpc: bool,

    /// Address to bind both listeners on
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub host: IpAddr,

    /// Seconds in-flight HTTPS connections get to finish on shutdown
    #[arg(long, default_value_t = 5)]
    pub drain_secs: u64,

    /// Seconds in-flight RPCs get to finish on shutdown
    #[arg(long, default_value_t = 5)]
    pub grpc_grace_secs: u64,

    /// Upper bound for the whole shutdown sequence
    #[arg(long, default_value_t = 10)]
    pub shutdown_timeout_secs: u64,

    /// Optional per-request timeout for HTTPS requests (off by default)
    #[arg(long)]
    pub request_timeout_secs: Option<u64>,
}

/// Check if the gRPC health endpoint is enabled via env var
pub fn is_grpc_health_enabled() -> bool {
    parse_toggle(std::env::var(GRPC_TOGGLE_ENV).ok().as_deref())
}

/// Only `1` and `true` switch the toggle on
pub fn parse_toggle(value: Option<&str>) -> bool {
    matches!(value, Some("1") | Some("true"))
}

/// Configuration errors detected before anything is started
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("application name must not be empty")]
    EmptyName,

    #[error("HTTPS and gRPC health endpoints cannot share port {0}")]
    PortConflict(u16),

    #[error("shutdown timeout must be greater than zero")]
    ZeroShutdownTimeout,
}

/// Immutable server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub https_port: u16,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub app_name: String,
    pub grpc_port: u16,
    pub grpc_enabled: bool,
    pub drain_period: Duration,
    pub grpc_grace_period: Duration,
    pub shutdown_timeout: Duration,
    pub request_timeout: Option<Duration>,
}

impl ServerConfig {
    /// Configuration with defaults for everything but the required fields
    pub fn new(
        app_name: impl Into<String>,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            https_port: DEFAULT_HTTPS_PORT,
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            app_name: app_name.into(),
            grpc_port: DEFAULT_GRPC_PORT,
            grpc_enabled: false,
            drain_period: Duration::from_secs(5),
            grpc_grace_period: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
            request_timeout: None,
        }
    }

    /// Build from parsed arguments and the environment toggle
    pub fn from_cli(cli: Cli, grpc_env_enabled: bool) -> Self {
        Self {
            host: cli.host,
            https_port: cli.port,
            cert_path: cli.certfile,
            key_path: cli.keyfile,
            app_name: cli.name,
            grpc_port: cli.grpc_port,
            grpc_enabled: cli.enable_grpc || grpc_env_enabled,
            drain_period: Duration::from_secs(cli.drain_secs),
            grpc_grace_period: Duration::from_secs(cli.grpc_grace_secs),
            shutdown_timeout: Duration::from_secs(cli.shutdown_timeout_secs),
            request_timeout: cli.request_timeout_secs.map(Duration::from_secs),
        }
    }

    /// Validate cross-field invariants
    ///
    /// TLS material is checked separately when it is loaded.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_name.is_empty() {
            return Err(ConfigError::EmptyName);
        }
        // Port 0 asks the OS for a free port, so two zeros never collide
        if self.grpc_enabled && self.https_port != 0 && self.https_port == self.grpc_port {
            return Err(ConfigError::PortConflict(self.https_port));
        }
        if self.shutdown_timeout.is_zero() {
            return Err(ConfigError::ZeroShutdownTimeout);
        }
        Ok(())
    }

    pub fn https_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.https_port)
    }

    pub fn grpc_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.grpc_port)
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
