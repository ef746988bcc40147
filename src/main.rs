use anyhow::Context as _;
use clap::Parser;
use tracing::{error, info};
use webapp_fixture::config::{is_grpc_health_enabled, Cli, ServerConfig};
use webapp_fixture::lifecycle::{Coordinator, RpcCapability, ShutdownReport};

/// Turn the final report into the process result
///
/// Any fault or stop timeout makes the process exit non-zero.
fn exit_status(report: &ShutdownReport) -> anyhow::Result<()> {
    if report.is_clean() {
        return Ok(());
    }

    let failures: Vec<String> = report
        .endpoints
        .iter()
        .filter_map(|(name, result)| result.as_ref().err().map(|e| format!("{}: {}", name, e)))
        .collect();

    if failures.is_empty() {
        anyhow::bail!("shutdown caused by {}", report.reason);
    }
    anyhow::bail!(
        "shutdown caused by {} did not complete cleanly ({})",
        report.reason,
        failures.join("; ")
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ServerConfig::from_cli(cli, is_grpc_health_enabled());

    info!(
        name = %config.app_name,
        https_port = config.https_port,
        grpc_port = config.grpc_port,
        grpc_enabled = config.grpc_enabled,
        "Starting webapp fixture"
    );

    let coordinator = Coordinator::new(config, RpcCapability::detect());
    let report = match coordinator.run().await {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "Startup failed");
            return Err(e).context("fixture failed to start");
        }
    };

    exit_status(&report)
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
