//! Lifecycle coordinator
//!
//! Drives the fixture through `INIT -> RUNNING -> STOPPING -> STOPPED`:
//! - INIT: validate config, load TLS material, resolve gRPC capability
//! - RUNNING: HTTPS endpoint (and optionally the gRPC health endpoint)
//!   serve as independent tasks
//! - STOPPING: entered on a termination request or an endpoint fault;
//!   every endpoint is stopped concurrently and joined within a bound
//! - STOPPED: terminal, summarized by a [`ShutdownReport`]

use crate::config::{ConfigError, ServerConfig};
use crate::server::{
    build_router, fault_channel, forward_signals, load_server_config, shutdown_channel,
    EndpointContext, EndpointError, EndpointFault, EndpointHandle, HttpsEndpoint, RouteTable,
    ShutdownController, ShutdownReason, ShutdownSignal, SignalListener, TlsError, FIXTURE_HEALTH,
};
#[cfg(feature = "grpc")]
use crate::server::ServiceHealthTable;
use futures::future::join_all;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Whether this build can serve gRPC health checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcCapability {
    Available,
    Unavailable,
}

impl RpcCapability {
    /// Resolve once at startup from the compiled feature set
    pub fn detect() -> Self {
        if cfg!(feature = "grpc") {
            RpcCapability::Available
        } else {
            RpcCapability::Unavailable
        }
    }
}

/// Errors that abort startup before the fixture reaches RUNNING
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to register termination signal handlers: {0}")]
    Signals(#[source] std::io::Error),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("gRPC health server requested but this build has no gRPC support (enable the `grpc` feature)")]
    GrpcUnavailable,

    #[error("Failed to start endpoint: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("Failed to encode health document: {0}")]
    HealthDocument(#[from] serde_json::Error),
}

/// Coordinator state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Init,
    Running,
    Stopping,
    Stopped,
}

/// Outcome of one completed lifecycle
#[derive(Debug)]
pub struct ShutdownReport {
    /// Why STOPPING was entered
    pub reason: ShutdownReason,
    /// Stop result per endpoint, in start order
    pub endpoints: Vec<(&'static str, Result<(), EndpointError>)>,
}

impl ShutdownReport {
    /// Requested shutdown where every endpoint stopped within the bound
    pub fn is_clean(&self) -> bool {
        !self.reason.is_fault() && self.endpoints.iter().all(|(_, result)| result.is_ok())
    }
}

/// Entry point of the lifecycle; owns the process-wide shutdown flag
pub struct Coordinator {
    config: ServerConfig,
    capability: RpcCapability,
    controller: ShutdownController,
    signal: ShutdownSignal,
    state: watch::Sender<LifecycleState>,
}

impl Coordinator {
    pub fn new(config: ServerConfig, capability: RpcCapability) -> Self {
        let (controller, signal) = shutdown_channel();
        let (state, _) = watch::channel(LifecycleState::Init);
        Self {
            config,
            capability,
            controller,
            signal,
            state,
        }
    }

    /// Controller that moves the fixture to STOPPING
    pub fn shutdown_controller(&self) -> ShutdownController {
        self.controller.clone()
    }

    /// Observe lifecycle transitions
    pub fn state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Start, serve until SIGINT/SIGTERM or a fault, then stop
    ///
    /// Signals received during startup are honoured as soon as the
    /// endpoints are up.
    pub async fn run(self) -> Result<ShutdownReport, StartupError> {
        let listener = SignalListener::register().map_err(|e| {
            error!(error = %e, "Failed to register signal handlers");
            StartupError::Signals(e)
        })?;
        let signals = tokio::spawn(forward_signals(listener, self.controller.clone()));
        let result = match self.start().await {
            Ok(server) => Ok(server.wait().await),
            Err(e) => Err(e),
        };
        signals.abort();
        result
    }

    /// INIT -> RUNNING
    ///
    /// Nothing is left listening when this returns an error.
    pub async fn start(self) -> Result<RunningServer, StartupError> {
        let config = self.config;
        config.validate()?;

        if config.grpc_enabled && self.capability == RpcCapability::Unavailable {
            error!("gRPC health server requested but gRPC support is not available");
            return Err(StartupError::GrpcUnavailable);
        }

        let tls_config = load_server_config(&config.cert_path, &config.key_path)?;
        info!(cert = %config.cert_path.display(), "TLS certificate loaded");

        let routes = Arc::new(RouteTable::new(&config.app_name, FIXTURE_HEALTH)?);
        let router = build_router(routes, config.request_timeout);

        let (fault_reporter, faults) = fault_channel();
        let ctx = EndpointContext {
            shutdown: self.signal.clone(),
            faults: fault_reporter,
        };

        let https = HttpsEndpoint::start(
            config.https_addr(),
            tls_config,
            router,
            config.drain_period,
            ctx.clone(),
        )?;
        let https_addr = https.local_addr();
        let mut endpoints: Vec<Box<dyn EndpointHandle>> = vec![Box::new(https)];

        let mut grpc_addr = None;
        let mut grpc_health = GrpcHealth::default();
        if config.grpc_enabled {
            match start_grpc(&config, ctx.clone()).await {
                Ok((grpc, health)) => {
                    grpc_addr = Some(grpc.local_addr());
                    grpc_health = health;
                    endpoints.push(grpc);
                }
                Err(e) => {
                    error!(
                        error = %e,
                        "gRPC health endpoint failed to start, stopping HTTPS endpoint"
                    );
                    stop_all(endpoints, &config).await;
                    return Err(e);
                }
            }
        } else {
            info!("gRPC health endpoint disabled");
        }

        let server = RunningServer {
            config,
            controller: self.controller,
            signal: self.signal,
            #[cfg(test)]
            ctx,
            faults,
            endpoints,
            state: self.state,
            https_addr,
            grpc_addr,
            grpc_health,
        };
        server.transition(LifecycleState::Running);
        Ok(server)
    }
}

/// Status table of the gRPC health endpoint, when it is running
#[cfg(feature = "grpc")]
type GrpcHealth = Option<ServiceHealthTable>;

#[cfg(not(feature = "grpc"))]
type GrpcHealth = ();

#[cfg(feature = "grpc")]
async fn start_grpc(
    config: &ServerConfig,
    ctx: EndpointContext,
) -> Result<(Box<dyn EndpointHandle>, GrpcHealth), StartupError> {
    let grpc = crate::server::GrpcHealthEndpoint::start(
        config.grpc_addr(),
        config.grpc_grace_period,
        ctx,
    )
    .await?;
    let table = grpc.health_table();
    let endpoint: Box<dyn EndpointHandle> = Box::new(grpc);
    Ok((endpoint, Some(table)))
}

#[cfg(not(feature = "grpc"))]
async fn start_grpc(
    _config: &ServerConfig,
    _ctx: EndpointContext,
) -> Result<(Box<dyn EndpointHandle>, GrpcHealth), StartupError> {
    Err(StartupError::GrpcUnavailable)
}

/// Stop every endpoint concurrently and join each within the shutdown bound
async fn stop_all(
    endpoints: Vec<Box<dyn EndpointHandle>>,
    config: &ServerConfig,
) -> Vec<(&'static str, Result<(), EndpointError>)> {
    for endpoint in &endpoints {
        endpoint.stop();
    }

    let bound = config.shutdown_timeout;
    join_all(endpoints.into_iter().map(|endpoint| async move {
        let name = endpoint.name();
        let result = endpoint.join(bound).await;
        match &result {
            Ok(()) => info!(endpoint = name, "Endpoint stopped"),
            Err(e) => warn!(endpoint = name, error = %e, "Endpoint did not stop cleanly"),
        }
        (name, result)
    }))
    .await
}

/// The fixture in RUNNING state
pub struct RunningServer {
    config: ServerConfig,
    controller: ShutdownController,
    signal: ShutdownSignal,
    #[cfg(test)]
    ctx: EndpointContext,
    faults: mpsc::UnboundedReceiver<EndpointFault>,
    endpoints: Vec<Box<dyn EndpointHandle>>,
    state: watch::Sender<LifecycleState>,
    https_addr: SocketAddr,
    grpc_addr: Option<SocketAddr>,
    #[cfg_attr(not(feature = "grpc"), allow(dead_code))]
    grpc_health: GrpcHealth,
}

impl RunningServer {
    /// Bound address of the HTTPS endpoint
    pub fn https_addr(&self) -> SocketAddr {
        self.https_addr
    }

    /// Bound address of the gRPC health endpoint, if enabled
    pub fn grpc_addr(&self) -> Option<SocketAddr> {
        self.grpc_addr
    }

    /// Service statuses answered by the gRPC health endpoint, if enabled
    ///
    /// Updates are visible to `Check` callers and pushed to `Watch` streams.
    #[cfg(feature = "grpc")]
    pub fn health_table(&self) -> Option<ServiceHealthTable> {
        self.grpc_health.clone()
    }

    /// Controller that moves the fixture to STOPPING
    pub fn shutdown_controller(&self) -> ShutdownController {
        self.controller.clone()
    }

    /// Shutdown signal and fault reporter for endpoints started by tests
    #[cfg(test)]
    pub(crate) fn context(&self) -> EndpointContext {
        self.ctx.clone()
    }

    /// Put an extra endpoint under this lifecycle
    ///
    /// It is stopped and joined together with the built-in endpoints.
    #[cfg(test)]
    pub(crate) fn attach(&mut self, endpoint: Box<dyn EndpointHandle>) {
        info!(endpoint = endpoint.name(), addr = %endpoint.local_addr(), "Endpoint attached");
        self.endpoints.push(endpoint);
    }

    fn transition(&self, next: LifecycleState) {
        self.state.send_replace(next);
        info!(state = ?next, "Lifecycle transition");
    }

    /// RUNNING -> STOPPING -> STOPPED
    ///
    /// Returns once every endpoint has stopped or been forced down.
    pub async fn wait(mut self) -> ShutdownReport {
        let mut signal = self.signal.clone();

        tokio::select! {
            _ = signal.wait() => {}
            Some(fault) = self.faults.recv() => {
                error!(
                    endpoint = fault.endpoint,
                    error = %fault.error,
                    "Endpoint fault, shutting down"
                );
                self.controller.shutdown(fault.shutdown_reason());
            }
        }

        let reason = self.signal.reason().unwrap_or(ShutdownReason::Requested);
        self.transition(LifecycleState::Stopping);
        info!(reason = %reason, "Initiating graceful shutdown");

        let endpoints = std::mem::take(&mut self.endpoints);
        let results = stop_all(endpoints, &self.config).await;

        self.transition(LifecycleState::Stopped);
        let report = ShutdownReport {
            reason,
            endpoints: results,
        };
        if report.is_clean() {
            info!("Fixture shut down gracefully");
        } else {
            warn!("Fixture shut down with errors");
        }
        report
    }
}

#[cfg(test)]
#[path = "lifecycle_test.rs"]
mod tests;
