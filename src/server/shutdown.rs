//! Graceful shutdown handling for the fixture
//!
//! Handles SIGTERM and SIGINT signals for clean shutdown:
//! - Flips the process-wide flag from RUNNING to STOPPING exactly once
//! - Lets every endpoint observe the transition
//! - Ignores repeated termination requests while already stopping

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Why the RUNNING -> STOPPING transition happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// An OS termination signal (SIGTERM, SIGINT, Ctrl+C)
    Signal(&'static str),
    /// An endpoint stopped serving while the process was still running
    Fault { endpoint: &'static str },
    /// Programmatic stop (tests, embedding)
    Requested,
}

impl ShutdownReason {
    /// Whether this transition should end the process with a failure status
    pub fn is_fault(&self) -> bool {
        matches!(self, ShutdownReason::Fault { .. })
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Signal(name) => write!(f, "signal {}", name),
            ShutdownReason::Fault { endpoint } => write!(f, "fault in {} endpoint", endpoint),
            ShutdownReason::Requested => f.write_str("requested"),
        }
    }
}

/// Receiving side of the shutdown flag
///
/// Cloned and handed to every component that needs to know whether the
/// process is stopping.
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<Option<ShutdownReason>>,
}

impl ShutdownSignal {
    /// Wait for shutdown signal
    pub async fn wait(&mut self) {
        while self.receiver.borrow().is_none() {
            if self.receiver.changed().await.is_err() {
                // Sender dropped, treat as shutdown
                break;
            }
        }
    }

    /// Check if shutdown was signaled (non-blocking)
    pub fn is_shutdown(&self) -> bool {
        self.receiver.borrow().is_some()
    }

    /// The reason recorded by the first transition, if any
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.receiver.borrow().clone()
    }
}

/// Controller for triggering shutdown
///
/// Cheap to clone; every clone drives the same one-shot flag.
#[derive(Clone)]
pub struct ShutdownController {
    sender: Arc<watch::Sender<Option<ShutdownReason>>>,
}

impl ShutdownController {
    /// Trigger shutdown
    ///
    /// Returns `true` only for the call that performed the transition.
    /// Later calls leave the recorded reason untouched.
    pub fn shutdown(&self, reason: ShutdownReason) -> bool {
        let mut pending = Some(reason);
        let transitioned = self.sender.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = pending.take();
            true
        });

        if transitioned {
            info!("Shutdown signal sent");
        } else if let Some(ignored) = pending {
            info!(reason = %ignored, "Already stopping, ignoring termination request");
        }
        transitioned
    }

    /// Check if shutdown was already triggered
    pub fn is_shutdown(&self) -> bool {
        self.sender.borrow().is_some()
    }

    /// Create another receiver for the same flag
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }
}

/// Create a new shutdown signal pair
///
/// Returns (controller, signal) where:
/// - controller: Used to trigger shutdown
/// - signal: Cloned and passed to components that need to listen
pub fn shutdown_channel() -> (ShutdownController, ShutdownSignal) {
    let (sender, receiver) = watch::channel(None);
    (
        ShutdownController {
            sender: Arc::new(sender),
        },
        ShutdownSignal { receiver },
    )
}

/// Registered SIGTERM and SIGINT handlers
///
/// Registered once, before any endpoint starts.
#[cfg(unix)]
pub struct SignalListener {
    sigterm: tokio::signal::unix::Signal,
    sigint: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl SignalListener {
    /// Register the handlers
    pub fn register() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }

    /// Wait for the next SIGTERM or SIGINT
    ///
    /// Returns the signal name, or `None` once the handlers are gone.
    pub async fn recv(&mut self) -> Option<&'static str> {
        tokio::select! {
            Some(()) = self.sigterm.recv() => {
                info!("Received SIGTERM");
                Some("SIGTERM")
            }
            Some(()) = self.sigint.recv() => {
                info!("Received SIGINT");
                Some("SIGINT")
            }
            else => None,
        }
    }
}

/// Registered Ctrl+C handler (Windows)
#[cfg(not(unix))]
pub struct SignalListener {
    ctrl_c: tokio::signal::windows::CtrlC,
}

#[cfg(not(unix))]
impl SignalListener {
    pub fn register() -> std::io::Result<Self> {
        Ok(Self {
            ctrl_c: tokio::signal::windows::ctrl_c()?,
        })
    }

    pub async fn recv(&mut self) -> Option<&'static str> {
        self.ctrl_c.recv().await?;
        info!("Received Ctrl+C");
        Some("CTRL_C")
    }
}

/// Forward every termination signal to the controller
///
/// Runs until the task is aborted. The first signal starts shutdown;
/// any further signal is a logged no-op.
pub async fn forward_signals(mut listener: SignalListener, controller: ShutdownController) {
    while let Some(name) = listener.recv().await {
        controller.shutdown(ShutdownReason::Signal(name));
    }
    warn!("Signal handlers closed, termination signals are no longer observed");
}
