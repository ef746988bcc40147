//! Network endpoints of the fixture
//!
//! - HTTPS endpoint: `/api/health` JSON plus a greeting on every other path
//! - gRPC endpoint (feature `grpc`): standard `grpc.health.v1.Health`
//!
//! Also provides graceful shutdown handling for SIGTERM/SIGINT.

pub mod endpoint;
#[cfg(feature = "grpc")]
pub mod grpc;
pub mod https;
pub mod router;
pub mod shutdown;
pub mod tls;

pub use endpoint::{
    fault_channel, EndpointContext, EndpointError, EndpointFault, EndpointHandle, FaultReporter,
};
#[cfg(feature = "grpc")]
pub use grpc::{GrpcHealthEndpoint, ServiceHealthTable, ServiceStatus, OVERALL_SERVICE};
pub use https::HttpsEndpoint;
pub use router::{build_router, HealthStatus, RouteTable, FIXTURE_HEALTH, HEALTH_PATH};
pub use shutdown::{
    forward_signals, shutdown_channel, ShutdownController, ShutdownReason, ShutdownSignal,
    SignalListener,
};
pub use tls::{load_server_config, TlsError};

#[cfg(test)]
#[path = "endpoint_test.rs"]
mod endpoint_tests;

#[cfg(all(test, feature = "grpc"))]
#[path = "grpc_test.rs"]
mod grpc_tests;

#[cfg(test)]
#[path = "https_test.rs"]
mod https_tests;

#[cfg(test)]
#[path = "router_test.rs"]
mod router_tests;

#[cfg(test)]
#[path = "shutdown_test.rs"]
mod shutdown_tests;

#[cfg(test)]
#[path = "tls_test.rs"]
mod tls_tests;
