//! Provisioner error types.
//!
//! Every error here is fatal to the process except [`ProvisionError::Cancelled`],
//! which only reports that a shutdown was requested. Transient failures never
//! reach this type: retry loops carry them as [`crate::retry::Step::Retry`].

use resource_client::ResourceError;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::error;

/// Errors that can occur while provisioning the control plane.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Invalid configuration (CIDR, port range, data dir, env overrides)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Control-plane runtime failed to start or exited
    #[error("Control plane error: {0}")]
    Runtime(String),

    /// Cluster object access failed
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    /// One of the core registrations failed
    #[error("{step} registration failed: {source}")]
    Registration {
        /// Which registration failed
        step: &'static str,
        /// Underlying client error
        #[source]
        source: ResourceError,
    },

    /// No server token was produced by the control plane
    #[error("Invalid server token: server token is empty")]
    MissingServerToken,

    /// An always-run controller failed to start
    #[error("Controller {name} failed: {source}")]
    Controller {
        /// Controller name
        name: String,
        /// Underlying failure
        #[source]
        source: Box<ProvisionError>,
    },

    /// A leader-only controller failed
    #[error("Leader controller {name} failed: {source}")]
    LeaderController {
        /// Controller name
        name: String,
        /// Underlying failure
        #[source]
        source: Box<ProvisionError>,
    },

    /// Leader controllers returned while they were expected to run until shutdown
    #[error("Leader controllers exited")]
    ControllersExited,

    /// This process lost the leadership lease
    #[error("Leadership lost for lock {0}")]
    LeadershipLost(String),

    /// A bounded retry loop ran out of attempts
    #[error("{operation} gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Operation name
        operation: String,
        /// Attempts made
        attempts: u32,
        /// Reason of the last retry
        last_error: String,
    },

    /// Shutdown was requested
    #[error("Cancelled")]
    Cancelled,

    /// Filesystem or process I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    /// Whether this error must terminate the process.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

/// Channel through which background tasks hand fatal errors to `main`.
///
/// Tasks never exit the process themselves; `main` owns the receiver and
/// decides how to terminate.
#[derive(Debug, Clone)]
pub struct FatalReporter {
    tx: mpsc::UnboundedSender<ProvisionError>,
}

impl FatalReporter {
    /// Create a reporter and the receiver `main` waits on.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProvisionError>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report an error. Non-fatal errors are dropped.
    pub fn report(&self, err: ProvisionError) {
        if !err.is_fatal() {
            return;
        }
        error!(error = %err, "Fatal provisioning error");
        if self.tx.send(err).is_err() {
            error!("Fatal error receiver is gone; process is already shutting down");
        }
    }
}
