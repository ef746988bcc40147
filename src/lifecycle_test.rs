//! Tests for the lifecycle coordinator
//!
//! End-to-end: start both endpoints, query them, stop, and check that
//! nothing is left listening.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;
use crate::test_support::{
    ephemeral_addr, https_client, is_refusing, self_signed_certs, test_config,
};
use std::time::Duration;

/// Reserve a free loopback port and release it again
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind(ephemeral_addr()).unwrap();
    listener.local_addr().unwrap().port()
}

/// Test: startup reaches RUNNING and a requested stop reaches STOPPED cleanly
#[tokio::test]
async fn test_start_and_stop_https_only() {
    let certs = self_signed_certs();
    let coordinator = Coordinator::new(test_config("bench", &certs), RpcCapability::Available);
    let state = coordinator.state();
    assert_eq!(*state.borrow(), LifecycleState::Init);

    let server = coordinator.start().await.expect("startup should succeed");
    assert_eq!(*state.borrow(), LifecycleState::Running);
    assert!(server.grpc_addr().is_none(), "gRPC is disabled by default");
    let https_addr = server.https_addr();

    let controller = server.shutdown_controller();
    let waiter = tokio::spawn(server.wait());
    assert!(controller.shutdown(ShutdownReason::Requested));

    let report = tokio::time::timeout(Duration::from_secs(10), waiter)
        .await
        .expect("shutdown should finish within the bound")
        .unwrap();

    assert!(report.is_clean(), "report: {:?}", report);
    assert_eq!(report.reason, ShutdownReason::Requested);
    assert_eq!(report.endpoints.len(), 1);
    assert_eq!(*state.borrow(), LifecycleState::Stopped);
    assert!(is_refusing(https_addr).await);
}

/// Test: a second termination request while stopping is a no-op
#[tokio::test]
async fn test_repeated_termination_is_idempotent() {
    let certs = self_signed_certs();
    let coordinator = Coordinator::new(test_config("bench", &certs), RpcCapability::Available);
    let controller = coordinator.shutdown_controller();
    let mut state = coordinator.state();

    let server = coordinator.start().await.unwrap();
    let waiter = tokio::spawn(server.wait());

    assert!(controller.shutdown(ShutdownReason::Signal("SIGTERM")));
    assert!(!controller.shutdown(ShutdownReason::Signal("SIGTERM")));
    assert!(!controller.shutdown(ShutdownReason::Signal("SIGINT")));

    let report = waiter.await.unwrap();

    assert!(report.is_clean());
    assert_eq!(report.reason, ShutdownReason::Signal("SIGTERM"));
    assert!(report.endpoints.iter().all(|(_, r)| r.is_ok()), "no double-close errors");

    // STOPPED is terminal
    state.mark_unchanged();
    assert_eq!(*state.borrow(), LifecycleState::Stopped);
    assert!(!controller.shutdown(ShutdownReason::Requested));
    assert!(!state.has_changed().unwrap_or(false));
}

/// Test: termination requested before RUNNING stops right after startup
#[tokio::test]
async fn test_termination_during_startup() {
    let certs = self_signed_certs();
    let coordinator = Coordinator::new(test_config("bench", &certs), RpcCapability::Available);
    coordinator
        .shutdown_controller()
        .shutdown(ShutdownReason::Signal("SIGINT"));

    let server = coordinator.start().await.unwrap();
    let report = tokio::time::timeout(Duration::from_secs(10), server.wait())
        .await
        .unwrap();

    assert!(report.is_clean());
    assert_eq!(report.reason, ShutdownReason::Signal("SIGINT"));
}

/// Test: invalid TLS material fails startup and opens no listener
#[tokio::test]
async fn test_invalid_certificate_opens_no_listener() {
    let certs = self_signed_certs();
    let mut config = test_config("bench", &certs);
    let port = free_port();
    config.https_port = port;
    config.cert_path = certs.dir.path().join("missing.crt");

    let result = Coordinator::new(config, RpcCapability::Available).start().await;

    assert!(matches!(result, Err(StartupError::Tls(_))));
    assert!(is_refusing(SocketAddr::from(([127, 0, 0, 1], port))).await);
}

/// Test: gRPC requested without runtime support fails before the TLS listener opens
#[tokio::test]
async fn test_grpc_unavailable_fails_before_tls_listener() {
    let certs = self_signed_certs();
    let mut config = test_config("bench", &certs);
    let port = free_port();
    config.https_port = port;
    config.grpc_enabled = true;

    let coordinator = Coordinator::new(config, RpcCapability::Unavailable);
    let state = coordinator.state();
    let result = coordinator.start().await;

    assert!(matches!(result, Err(StartupError::GrpcUnavailable)));
    assert!(is_refusing(SocketAddr::from(([127, 0, 0, 1], port))).await);
    assert_eq!(*state.borrow(), LifecycleState::Init);
}

/// Test: gRPC disabled does not need the runtime
#[tokio::test]
async fn test_grpc_disabled_ignores_capability() {
    let certs = self_signed_certs();
    let server = Coordinator::new(test_config("bench", &certs), RpcCapability::Unavailable)
        .start()
        .await
        .unwrap();

    server.shutdown_controller().shutdown(ShutdownReason::Requested);
    assert!(server.wait().await.is_clean());
}

/// Test: invalid configuration is rejected during INIT
#[tokio::test]
async fn test_invalid_config_rejected() {
    let certs = self_signed_certs();
    let config = test_config("", &certs);

    let result = Coordinator::new(config, RpcCapability::Available).start().await;

    assert!(matches!(
        result,
        Err(StartupError::Config(ConfigError::EmptyName))
    ));
}

/// Test: an endpoint fault while RUNNING drives STOPPING and a failed report
#[tokio::test]
async fn test_endpoint_fault_triggers_shutdown() {
    let certs = self_signed_certs();
    let server = Coordinator::new(test_config("bench", &certs), RpcCapability::Available)
        .start()
        .await
        .unwrap();
    let https_addr = server.https_addr();
    let controller = server.shutdown_controller();

    server.context().faults.report(EndpointFault {
        endpoint: "https",
        error: "accept failed: too many open files".to_string(),
    });

    let report = tokio::time::timeout(Duration::from_secs(10), server.wait())
        .await
        .unwrap();

    assert!(!report.is_clean(), "fault must not be a clean exit");
    assert_eq!(report.reason, ShutdownReason::Fault { endpoint: "https" });
    assert!(controller.is_shutdown());
    assert!(is_refusing(https_addr).await);
}

/// Test: attached endpoints are stopped with the built-in ones
#[tokio::test]
async fn test_attached_endpoint_stopped_on_shutdown() {
    let certs = self_signed_certs();
    let mut server = Coordinator::new(test_config("bench", &certs), RpcCapability::Available)
        .start()
        .await
        .unwrap();

    let tls = crate::server::load_server_config(&certs.cert_path, &certs.key_path).unwrap();
    let routes = Arc::new(RouteTable::new("extra", FIXTURE_HEALTH).unwrap());
    let extra = HttpsEndpoint::start(
        ephemeral_addr(),
        tls,
        build_router(routes, None),
        Duration::from_millis(200),
        server.context(),
    )
    .unwrap();
    let extra_addr = extra.local_addr();
    server.attach(Box::new(extra));

    server.shutdown_controller().shutdown(ShutdownReason::Requested);
    let report = server.wait().await;

    assert!(report.is_clean());
    assert_eq!(report.endpoints.len(), 2);
    assert!(is_refusing(extra_addr).await);
}

/// Test: run() registers signal handlers, serves, and reports after a stop
#[tokio::test]
async fn test_run_serves_until_stopped() {
    let certs = self_signed_certs();
    let coordinator = Coordinator::new(test_config("bench", &certs), RpcCapability::Available);
    let controller = coordinator.shutdown_controller();
    let mut state = coordinator.state();
    let run = tokio::spawn(coordinator.run());

    let _ = state
        .wait_for(|current| *current != LifecycleState::Init)
        .await
        .unwrap();
    controller.shutdown(ShutdownReason::Requested);

    let report = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("run() should return within the bound")
        .unwrap()
        .expect("startup should succeed");

    assert!(report.is_clean(), "report: {:?}", report);
    assert_eq!(report.endpoints.len(), 1);
    assert_eq!(*state.borrow(), LifecycleState::Stopped);
}

#[test]
fn test_capability_follows_feature() {
    assert_eq!(
        RpcCapability::detect() == RpcCapability::Available,
        cfg!(feature = "grpc")
    );
}

#[cfg(feature = "grpc")]
mod grpc {
    use super::*;
    use crate::server::router::HealthStatus;
    use crate::server::{ServiceStatus, OVERALL_SERVICE};
    use tonic::transport::Channel;
    use tonic_health::pb::health_check_response::ServingStatus as WireStatus;
    use tonic_health::pb::health_client::HealthClient;
    use tonic_health::pb::HealthCheckRequest;

    async fn check(addr: SocketAddr, service: &str) -> Result<i32, tonic::Status> {
        let channel = Channel::from_shared(format!("http://{}", addr))
            .unwrap()
            .connect()
            .await
            .expect("Failed to connect to gRPC health endpoint");
        let mut client = HealthClient::new(channel);
        client
            .check(HealthCheckRequest {
                service: service.to_string(),
            })
            .await
            .map(|response| response.into_inner().status)
    }

    /// End-to-end: name "bench", both endpoints, termination signal, clean exit
    #[tokio::test]
    async fn test_end_to_end_bench_scenario() {
        let certs = self_signed_certs();
        let mut config = test_config("bench", &certs);
        config.grpc_enabled = true;

        let coordinator = Coordinator::new(config, RpcCapability::Available);
        let controller = coordinator.shutdown_controller();
        let server = coordinator.start().await.expect("startup should succeed");
        let https_addr = server.https_addr();
        let grpc_addr = server.grpc_addr().expect("gRPC endpoint should be running");
        let waiter = tokio::spawn(server.wait());

        // Health JSON
        let client = https_client();
        let health = client
            .get(format!("https://{}/api/health", https_addr))
            .send()
            .await
            .unwrap();
        assert_eq!(health.status(), 200);
        assert_eq!(health.headers()["content-type"], "application/json");
        let body: HealthStatus = health.json().await.unwrap();
        assert_eq!(body, FIXTURE_HEALTH);

        // Greeting
        let root = client
            .get(format!("https://{}/", https_addr))
            .send()
            .await
            .unwrap();
        assert_eq!(root.status(), 200);
        assert_eq!(root.text().await.unwrap(), "Welcome to bench");

        // gRPC overall service
        assert_eq!(check(grpc_addr, "").await.unwrap(), WireStatus::Serving as i32);

        // Termination signal
        assert!(controller.shutdown(ShutdownReason::Signal("SIGTERM")));
        let report = tokio::time::timeout(Duration::from_secs(10), waiter)
            .await
            .expect("shutdown should finish within the bound")
            .unwrap();

        assert!(report.is_clean(), "report: {:?}", report);
        assert_eq!(report.endpoints.len(), 2);
        assert!(is_refusing(https_addr).await);
        assert!(is_refusing(grpc_addr).await);
    }

    /// Test: status changes made through the running server reach gRPC clients
    #[tokio::test]
    async fn test_health_table_updates_reach_clients() {
        let certs = self_signed_certs();
        let mut config = test_config("bench", &certs);
        config.grpc_enabled = true;

        let server = Coordinator::new(config, RpcCapability::Available)
            .start()
            .await
            .unwrap();
        let grpc_addr = server.grpc_addr().unwrap();
        let mut table = server.health_table().expect("gRPC is enabled");

        table.set(OVERALL_SERVICE, ServiceStatus::NotServing).await;
        assert_eq!(
            check(grpc_addr, OVERALL_SERVICE).await.unwrap(),
            WireStatus::NotServing as i32
        );

        server.shutdown_controller().shutdown(ShutdownReason::Requested);
        assert!(server.wait().await.is_clean());
    }

    /// Test: without gRPC there is no status table
    #[tokio::test]
    async fn test_no_health_table_without_grpc() {
        let certs = self_signed_certs();
        let server = Coordinator::new(test_config("bench", &certs), RpcCapability::Available)
            .start()
            .await
            .unwrap();

        assert!(server.health_table().is_none());

        server.shutdown_controller().shutdown(ShutdownReason::Requested);
        assert!(server.wait().await.is_clean());
    }

    /// Test: gRPC port in use aborts startup and closes the HTTPS listener again
    #[tokio::test]
    async fn test_grpc_bind_failure_stops_https() {
        let certs = self_signed_certs();
        let occupied = std::net::TcpListener::bind(ephemeral_addr()).unwrap();
        let mut config = test_config("bench", &certs);
        let https_port = free_port();
        config.https_port = https_port;
        config.grpc_enabled = true;
        config.grpc_port = occupied.local_addr().unwrap().port();

        let result = Coordinator::new(config, RpcCapability::Available).start().await;

        assert!(matches!(
            result,
            Err(StartupError::Endpoint(EndpointError::Bind { .. }))
        ));
        assert!(is_refusing(SocketAddr::from(([127, 0, 0, 1], https_port))).await);
    }
}
