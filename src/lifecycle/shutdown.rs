//! Shutdown coordination for the proxy.

use std::time::Duration;

use tokio::sync::watch;

use crate::lifecycle::controller::{LifecycleController, LifecycleState};
use crate::net::ConnectionTracker;

/// Receiver side of the shutdown trigger.
///
/// Cloned into every long-running task that must react to shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<LifecycleState>,
}

impl ShutdownSignal {
    pub(crate) fn new(rx: watch::Receiver<LifecycleState>) -> Self {
        Self { rx }
    }

    /// Wait until the lifecycle leaves `Ready`.
    ///
    /// Also resolves if the controller is gone.
    pub async fn recv(&mut self) {
        let _ = self.rx.wait_for(|state| *state != LifecycleState::Ready).await;
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow() != LifecycleState::Ready
    }
}

/// How a drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every connection closed in time.
    Completed,
    /// The drain timeout elapsed first; `remaining` connections were left running.
    TimedOut { remaining: u64 },
}

/// Wait for open connections to finish, up to `limit`, then mark the
/// lifecycle stopped. Connections still open at the deadline are not aborted.
pub async fn drain(
    tracker: &ConnectionTracker,
    limit: Duration,
    lifecycle: &LifecycleController,
) -> DrainOutcome {
    tracing::info!(
        open_connections = tracker.active_count(),
        drain_timeout_ms = limit.as_millis() as u64,
        "Draining connections"
    );

    let outcome = match tokio::time::timeout(limit, tracker.wait_for_drain()).await {
        Ok(()) => DrainOutcome::Completed,
        Err(_) => DrainOutcome::TimedOut {
            remaining: tracker.active_count(),
        },
    };

    match outcome {
        DrainOutcome::Completed => tracing::info!("All connections drained"),
        DrainOutcome::TimedOut { remaining } => {
            tracing::warn!(remaining, "Drain timeout elapsed, stopping with open connections")
        }
    }

    lifecycle.mark_stopped();
    outcome
}
