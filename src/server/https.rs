//! HTTPS endpoint: TLS listener serving the fixture routes
//!
//! The listener is bound synchronously so that bind errors surface before
//! any task is spawned. Stopping closes the listening socket at once and
//! gives accepted connections a bounded drain period.

use super::endpoint::{
    classify_exit, join_bounded, EndpointContext, EndpointError, EndpointHandle, StopFlag,
};
use super::tls::LoggingTlsAcceptor;
use async_trait::async_trait;
use axum::Router;
use axum_server::Handle;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// Endpoint name used in logs and errors
pub const HTTPS_ENDPOINT: &str = "https";

/// Running HTTPS endpoint
pub struct HttpsEndpoint {
    local_addr: SocketAddr,
    handle: Handle,
    stop: StopFlag,
    drain: Duration,
    task: JoinHandle<Result<(), EndpointError>>,
}

fn bind_error(addr: SocketAddr) -> impl FnOnce(std::io::Error) -> EndpointError {
    move |source| EndpointError::Bind {
        endpoint: HTTPS_ENDPOINT,
        addr,
        source,
    }
}

impl HttpsEndpoint {
    /// Bind `addr` and start serving `router` over TLS
    ///
    /// # Arguments
    /// * `addr` - Address to bind (port 0 picks a free port)
    /// * `tls_config` - Loaded certificate chain and key
    /// * `router` - Request routes
    /// * `drain` - How long accepted connections may run after `stop()`
    /// * `ctx` - Shutdown signal and fault reporter from the coordinator
    pub fn start(
        addr: SocketAddr,
        tls_config: Arc<rustls::ServerConfig>,
        router: Router,
        drain: Duration,
        ctx: EndpointContext,
    ) -> Result<Self, EndpointError> {
        let listener = TcpListener::bind(addr).map_err(bind_error(addr))?;
        listener.set_nonblocking(true).map_err(bind_error(addr))?;
        let local_addr = listener.local_addr().map_err(bind_error(addr))?;

        let handle = Handle::new();
        let stop = StopFlag::new();

        let server = axum_server::from_tcp(listener)
            .acceptor(LoggingTlsAcceptor::new(tls_config))
            .handle(handle.clone());

        // Log after successful bind - server is actually listening
        info!(addr = %local_addr, "HTTPS endpoint listening");

        let task_stop = stop.clone();
        let task = tokio::spawn(async move {
            let result = server
                .serve(router.into_make_service_with_connect_info::<SocketAddr>())
                .await;
            classify_exit(HTTPS_ENDPOINT, result, task_stop.is_set(), &ctx)
        });

        Ok(Self {
            local_addr,
            handle,
            stop,
            drain,
            task,
        })
    }
}

#[async_trait]
impl EndpointHandle for HttpsEndpoint {
    fn name(&self) -> &'static str {
        HTTPS_ENDPOINT
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn stop(&self) {
        if self.stop.trigger() {
            info!(drain = ?self.drain, "Stopping HTTPS endpoint");
            self.handle.graceful_shutdown(Some(self.drain));
        }
    }

    async fn join(self: Box<Self>, bound: Duration) -> Result<(), EndpointError> {
        join_bounded(HTTPS_ENDPOINT, self.task, bound).await
    }
}
