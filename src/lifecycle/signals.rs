//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT)
//! - Translate every signal into the single shutdown trigger
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - Repeated signals are logged and otherwise ignored; the drain timeout
//!   already bounds how long shutdown can take

use std::io;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::lifecycle::controller::LifecycleController;

/// Spawn a task that starts the drain on SIGINT or SIGTERM.
pub fn spawn_signal_handler(lifecycle: Arc<LifecycleController>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = listen(&lifecycle).await {
            tracing::error!(error = %err, "Failed to install signal handlers");
        }
    })
}

#[cfg(unix)]
async fn listen(lifecycle: &LifecycleController) -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    loop {
        let name = tokio::select! {
            _ = terminate.recv() => "SIGTERM",
            _ = interrupt.recv() => "SIGINT",
        };
        trigger(lifecycle, name);
    }
}

#[cfg(not(unix))]
async fn listen(lifecycle: &LifecycleController) -> io::Result<()> {
    loop {
        tokio::signal::ctrl_c().await?;
        trigger(lifecycle, "ctrl-c");
    }
}

fn trigger(lifecycle: &LifecycleController, signal: &str) {
    if lifecycle.begin_drain() {
        tracing::info!(signal, "Shutdown signal received");
    } else {
        tracing::info!(signal, state = %lifecycle.state(), "Shutdown already in progress");
    }
}
