//! Backend fixture for load-balancer and health-check benchmarks
//!
//! Serves a greeting and a static `/api/health` document over HTTPS, and
//! optionally the standard gRPC health service on a second port. Both
//! endpoints stop together on SIGINT/SIGTERM.

pub mod config;
pub mod lifecycle;
pub mod server;

#[cfg(test)]
mod test_support;
