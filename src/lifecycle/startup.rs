//! Startup orchestration.
//!
//! # Responsibilities
//! - Load and validate configuration
//! - Build the forwarding pipeline and load TLS material
//! - Bind the listener and begin accepting traffic
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - TLS loads before bind, so a bad certificate never opens a port
//! - Listeners start last (traffic only when ready)

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::config::{load_config, validate_config, ConfigError, ProxyConfig};
use crate::http::HttpServer;
use crate::lifecycle::controller::LifecycleController;
use crate::lifecycle::signals;
use crate::net::{Listener, ListenerError, TlsError};
use crate::upstream::TargetError;

/// Fatal startup failures.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("listener error: {0}")]
    Listener(#[from] ListenerError),

    #[error("invalid backend target: {0}")]
    Target(#[from] TargetError),
}

/// Read the config file, or fall back to validated defaults.
pub fn resolve_config(path: Option<&Path>) -> Result<ProxyConfig, StartupError> {
    match path {
        Some(path) => Ok(load_config(path)?),
        None => {
            let config = ProxyConfig::default();
            validate_config(&config).map_err(ConfigError::Validation)?;
            Ok(config)
        }
    }
}

/// Run the proxy until a shutdown signal has been handled and drained.
pub async fn launch(config: ProxyConfig) -> Result<(), StartupError> {
    let lifecycle = Arc::new(LifecycleController::new());

    let server = HttpServer::new(config.clone(), lifecycle.clone())?;
    let listener = Listener::bind(&config.listener).await?;

    signals::spawn_signal_handler(lifecycle);

    server.run(listener).await?;
    Ok(())
}
