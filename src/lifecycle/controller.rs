//! Readiness and shutdown state machine.
//!
//! ```text
//! Ready ──begin_drain()──▶ Draining ──mark_stopped()──▶ Stopped
//! ```
//!
//! Transitions only move forward. The state is an atomic so health checks
//! read it without locking; a watch channel wakes tasks waiting on shutdown.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::watch;

use crate::lifecycle::shutdown::ShutdownSignal;

/// Lifecycle state of the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Ready = 0,
    Draining = 1,
    Stopped = 2,
}

impl LifecycleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LifecycleState::Ready,
            1 => LifecycleState::Draining,
            _ => LifecycleState::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Ready => "ready",
            LifecycleState::Draining => "draining",
            LifecycleState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owner of the process-wide readiness state.
///
/// Shared by reference (`Arc`) between the health endpoints, the signal
/// handler and the server's accept loop.
#[derive(Debug)]
pub struct LifecycleController {
    state: AtomicU8,
    notify: watch::Sender<LifecycleState>,
}

impl LifecycleController {
    pub fn new() -> Self {
        let (notify, _) = watch::channel(LifecycleState::Ready);
        Self {
            state: AtomicU8::new(LifecycleState::Ready as u8),
            notify,
        }
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.state() == LifecycleState::Ready
    }

    /// Ready → Draining. Returns `false` if shutdown had already begun.
    pub fn begin_drain(&self) -> bool {
        if !self.advance(LifecycleState::Ready, LifecycleState::Draining) {
            return false;
        }
        tracing::info!("Readiness withdrawn, draining");
        true
    }

    /// Draining → Stopped. Returns `false` from any other state.
    pub fn mark_stopped(&self) -> bool {
        if !self.advance(LifecycleState::Draining, LifecycleState::Stopped) {
            return false;
        }
        tracing::info!("Lifecycle stopped");
        true
    }

    /// A handle that resolves once shutdown begins.
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal::new(self.notify.subscribe())
    }

    fn advance(&self, from: LifecycleState, to: LifecycleState) -> bool {
        let swapped = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            self.notify.send_replace(to);
        }
        swapped
    }
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}
