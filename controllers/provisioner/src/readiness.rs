//! Readiness signal and gate.
//!
//! The control plane runtime owns a [`ReadinessTrigger`] and fires it once the
//! API server accepts administrative requests. The orchestrator holds the
//! matching [`ReadinessSignal`] and runs the post-readiness pipeline behind
//! [`run_when_ready`].

use std::future::Future;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Sending half of the readiness signal. Consumed on fire, so it fires at most once.
#[derive(Debug)]
pub struct ReadinessTrigger {
    tx: oneshot::Sender<()>,
}

/// Receiving half of the readiness signal.
#[derive(Debug)]
pub struct ReadinessSignal {
    rx: oneshot::Receiver<()>,
}

/// Create a linked trigger/signal pair.
pub fn readiness_channel() -> (ReadinessTrigger, ReadinessSignal) {
    let (tx, rx) = oneshot::channel();
    (ReadinessTrigger { tx }, ReadinessSignal { rx })
}

impl ReadinessTrigger {
    /// Announce that the control plane is ready.
    pub fn fire(self) {
        if self.tx.send(()).is_err() {
            debug!("Readiness fired after the gate went away");
        }
    }
}

impl ReadinessSignal {
    /// Resolve when the trigger fires.
    ///
    /// A trigger dropped without firing means the runtime never became
    /// ready; this future then never resolves.
    pub async fn fired(self) {
        if self.rx.await.is_err() {
            debug!("Readiness trigger dropped without firing");
            std::future::pending::<()>().await;
        }
    }
}

/// Wait for readiness, then run `pipeline` exactly once.
///
/// # Returns
/// * `Ok(Some(T))` - the signal fired and the pipeline succeeded
/// * `Ok(None)` - cancelled before the signal fired; pipeline not run
/// * `Err(E)` - the pipeline failed
pub async fn run_when_ready<T, E, F, Fut>(
    cancel: CancellationToken,
    signal: ReadinessSignal,
    pipeline: F,
) -> Result<Option<T>, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => {
            info!("Shutdown requested before the API server became ready");
            Ok(None)
        }
        () = signal.fired() => {
            info!("API server is ready, starting controllers");
            pipeline().await.map(Some)
        }
    }
}
