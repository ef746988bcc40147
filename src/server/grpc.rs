//! gRPC health check endpoint
//!
//! Serves the standard `grpc.health.v1.Health` service (unary `Check` and
//! streaming `Watch`) on a plaintext listener.
//! See: https://github.com/grpc/grpc/blob/master/doc/health-checking.md
//!
//! The overall service (empty name) is registered as SERVING before the
//! listener starts accepting.

use super::endpoint::{
    classify_exit, join_bounded, EndpointContext, EndpointError, EndpointHandle, StopFlag,
};
use async_trait::async_trait;
use futures::Stream;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tonic::transport::Server;
use tonic_health::server::{health_reporter, HealthReporter};
use tracing::{info, warn};

/// Endpoint name used in logs and errors
pub const GRPC_ENDPOINT: &str = "grpc-health";

/// Service name standing for the server as a whole
pub const OVERALL_SERVICE: &str = "";

/// Serving status of a named service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Serving,
    NotServing,
    /// Not registered
    Unknown,
}

impl From<ServiceStatus> for tonic_health::ServingStatus {
    fn from(status: ServiceStatus) -> Self {
        match status {
            ServiceStatus::Serving => tonic_health::ServingStatus::Serving,
            ServiceStatus::NotServing => tonic_health::ServingStatus::NotServing,
            ServiceStatus::Unknown => tonic_health::ServingStatus::Unknown,
        }
    }
}

impl From<tonic_health::ServingStatus> for ServiceStatus {
    fn from(status: tonic_health::ServingStatus) -> Self {
        match status {
            tonic_health::ServingStatus::Serving => ServiceStatus::Serving,
            tonic_health::ServingStatus::NotServing => ServiceStatus::NotServing,
            tonic_health::ServingStatus::Unknown => ServiceStatus::Unknown,
        }
    }
}

/// Service name -> serving status
///
/// Writes go to the tonic health reporter, so `Check` answers and `Watch`
/// subscribers see every change. Clones share the same table.
#[derive(Clone)]
pub struct ServiceHealthTable {
    reporter: HealthReporter,
    statuses: Arc<RwLock<HashMap<String, ServiceStatus>>>,
}

impl ServiceHealthTable {
    pub fn new(reporter: HealthReporter) -> Self {
        Self {
            reporter,
            statuses: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register or update a service
    ///
    /// Setting [`ServiceStatus::Unknown`] removes the registration.
    pub async fn set(&mut self, service: &str, status: ServiceStatus) {
        let mut statuses = self.statuses.write().await;
        match status {
            ServiceStatus::Unknown => {
                statuses.remove(service);
                self.reporter.clear_service_status(service).await;
            }
            known => {
                statuses.insert(service.to_string(), known);
                self.reporter.set_service_status(service, known.into()).await;
            }
        }
        info!(service = %service, status = ?status, "Health status updated");
    }

    /// Current status; unregistered names are [`ServiceStatus::Unknown`]
    pub async fn get(&self, service: &str) -> ServiceStatus {
        self.statuses
            .read()
            .await
            .get(service)
            .copied()
            .unwrap_or(ServiceStatus::Unknown)
    }
}

/// Running gRPC health endpoint
pub struct GrpcHealthEndpoint {
    local_addr: SocketAddr,
    stop: StopFlag,
    table: ServiceHealthTable,
    task: JoinHandle<Result<(), EndpointError>>,
}

/// Accepted connections until `stop` is set
///
/// The stream owns the listener and drops it when it ends, so the port
/// refuses connections for the whole grace period.
fn accept_until_stopped(
    listener: TcpListener,
    stop: StopFlag,
) -> impl Stream<Item = std::io::Result<TcpStream>> {
    futures::stream::unfold(Some((listener, stop)), |state| async move {
        let Some((listener, stop)) = state else {
            return None;
        };
        tokio::select! {
            biased;
            _ = stop.wait() => None,
            accepted = listener.accept() => {
                let item = accepted.map(|(stream, _)| stream);
                Some((item, Some((listener, stop))))
            }
        }
    })
}

fn bind_error(addr: SocketAddr) -> impl FnOnce(std::io::Error) -> EndpointError {
    move |source| EndpointError::Bind {
        endpoint: GRPC_ENDPOINT,
        addr,
        source,
    }
}

impl GrpcHealthEndpoint {
    /// Bind `addr`, register the overall service and start serving
    ///
    /// After `stop()`, new connections are refused and in-flight RPCs get
    /// `grace` to finish before the server is dropped.
    pub async fn start(
        addr: SocketAddr,
        grace: Duration,
        ctx: EndpointContext,
    ) -> Result<Self, EndpointError> {
        let listener = std::net::TcpListener::bind(addr).map_err(bind_error(addr))?;
        listener.set_nonblocking(true).map_err(bind_error(addr))?;
        let local_addr = listener.local_addr().map_err(bind_error(addr))?;
        let listener = TcpListener::from_std(listener).map_err(bind_error(addr))?;

        let (reporter, health_service) = health_reporter();
        let mut table = ServiceHealthTable::new(reporter);
        table.set(OVERALL_SERVICE, ServiceStatus::Serving).await;

        let stop = StopFlag::new();
        let incoming = accept_until_stopped(listener, stop.clone());

        info!(addr = %local_addr, "gRPC health endpoint listening");
        info!("gRPC health check available at grpc.health.v1.Health/Check");

        let task_stop = stop.clone();
        let task = tokio::spawn(async move {
            // Drain starts once `incoming` ends and has dropped the listener
            let serve = Server::builder()
                .add_service(health_service)
                .serve_with_incoming_shutdown(incoming, std::future::pending::<()>());
            tokio::pin!(serve);

            let result = tokio::select! {
                result = &mut serve => result,
                _ = async {
                    task_stop.wait().await;
                    tokio::time::sleep(grace).await;
                } => {
                    warn!(grace = ?grace, "Grace period elapsed, dropping in-flight RPCs");
                    Ok(())
                }
            };

            classify_exit(GRPC_ENDPOINT, result, task_stop.is_set(), &ctx)
        });

        Ok(Self {
            local_addr,
            stop,
            table,
            task,
        })
    }

    /// Shared handle to the status table served by this endpoint
    pub fn health_table(&self) -> ServiceHealthTable {
        self.table.clone()
    }
}

#[async_trait]
impl EndpointHandle for GrpcHealthEndpoint {
    fn name(&self) -> &'static str {
        GRPC_ENDPOINT
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn stop(&self) {
        if self.stop.trigger() {
            info!("Stopping gRPC health endpoint, rejecting new RPCs");
        }
    }

    async fn join(self: Box<Self>, bound: Duration) -> Result<(), EndpointError> {
        join_bounded(GRPC_ENDPOINT, self.task, bound).await
    }
}
