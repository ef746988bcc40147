//! Endpoint handles and failure reporting
//!
//! Every listener the coordinator starts hands back an [`EndpointHandle`].
//! The handle is the only way to stop the endpoint; nothing is reached
//! through globals.
//!
//! An endpoint whose serve loop ends while the process is still RUNNING
//! reports an [`EndpointFault`] so the coordinator can begin shutdown.

use super::shutdown::{ShutdownReason, ShutdownSignal};
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Errors produced by endpoints
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("Failed to bind {endpoint} listener on {addr}: {source}")]
    Bind {
        endpoint: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("{endpoint} endpoint failed while serving: {reason}")]
    Serve {
        endpoint: &'static str,
        reason: String,
    },

    #[error("{endpoint} listener closed unexpectedly")]
    ListenerClosed { endpoint: &'static str },

    #[error("{endpoint} endpoint did not stop within {bound:?}")]
    StopTimeout {
        endpoint: &'static str,
        bound: Duration,
    },

    #[error("{endpoint} endpoint task ended abnormally: {reason}")]
    Task {
        endpoint: &'static str,
        reason: String,
    },
}

/// An endpoint stopped serving while the process was RUNNING
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointFault {
    pub endpoint: &'static str,
    pub error: String,
}

impl EndpointFault {
    pub fn shutdown_reason(&self) -> ShutdownReason {
        ShutdownReason::Fault {
            endpoint: self.endpoint,
        }
    }
}

/// Sending side of the fault channel
#[derive(Clone)]
pub struct FaultReporter {
    sender: mpsc::UnboundedSender<EndpointFault>,
}

impl FaultReporter {
    pub fn report(&self, fault: EndpointFault) {
        // Receiver gone means the coordinator is already past RUNNING
        let _ = self.sender.send(fault);
    }
}

/// Create the fault channel shared by all endpoints
pub fn fault_channel() -> (FaultReporter, mpsc::UnboundedReceiver<EndpointFault>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (FaultReporter { sender }, receiver)
}

/// What every endpoint receives from the coordinator at construction
#[derive(Clone)]
pub struct EndpointContext {
    pub shutdown: ShutdownSignal,
    pub faults: FaultReporter,
}

/// Per-endpoint "stop was requested" flag
///
/// Set by the handle's `stop()`; the serve loop waits on it and consults
/// it to tell a requested close from an unexpected one.
#[derive(Clone)]
pub(crate) struct StopFlag {
    sender: Arc<watch::Sender<bool>>,
}

impl StopFlag {
    pub(crate) fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Returns `true` only for the first call
    pub(crate) fn trigger(&self) -> bool {
        self.sender.send_if_modified(|stopped| {
            if *stopped {
                return false;
            }
            *stopped = true;
            true
        })
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.sender.borrow()
    }

    pub(crate) async fn wait(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as self, so this only returns once set
        let _ = receiver.wait_for(|stopped| *stopped).await;
    }
}

/// Handle to a running endpoint
#[async_trait]
pub trait EndpointHandle: Send {
    /// Short name used in logs and errors
    fn name(&self) -> &'static str;

    /// Address the listener is bound to
    fn local_addr(&self) -> SocketAddr;

    /// Stop accepting new work and begin draining
    ///
    /// Safe to call more than once.
    fn stop(&self);

    /// Wait for the endpoint task to finish, forcing it down after `bound`
    async fn join(self: Box<Self>, bound: Duration) -> Result<(), EndpointError>;
}

/// Decide whether a finished serve loop was a clean stop or a fault
///
/// A loop that ends after `stop()` or after the process entered STOPPING
/// is clean. The same exit while RUNNING is reported as a fault.
pub(crate) fn classify_exit<E: fmt::Display>(
    endpoint: &'static str,
    result: Result<(), E>,
    stop_requested: bool,
    ctx: &EndpointContext,
) -> Result<(), EndpointError> {
    if stop_requested || ctx.shutdown.is_shutdown() {
        if let Err(e) = result {
            warn!(endpoint, error = %e, "Endpoint reported an error while stopping");
        }
        info!(endpoint, "Listener closed");
        return Ok(());
    }

    let err = match result {
        Err(e) => EndpointError::Serve {
            endpoint,
            reason: e.to_string(),
        },
        Ok(()) => EndpointError::ListenerClosed { endpoint },
    };

    error!(endpoint, error = %err, "Endpoint stopped while running");
    ctx.faults.report(EndpointFault {
        endpoint,
        error: err.to_string(),
    });
    Err(err)
}

/// Join an endpoint task, aborting it if it outlives `bound`
pub(crate) async fn join_bounded(
    endpoint: &'static str,
    mut task: JoinHandle<Result<(), EndpointError>>,
    bound: Duration,
) -> Result<(), EndpointError> {
    match tokio::time::timeout(bound, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(EndpointError::Task {
            endpoint,
            reason: join_err.to_string(),
        }),
        Err(_) => {
            warn!(endpoint, bound = ?bound, "Endpoint did not stop in time, forcing close");
            task.abort();
            Err(EndpointError::StopTimeout { endpoint, bound })
        }
    }
}
