//! Configuration validation.
//!
//! Serde handles syntax; this pass checks values that must make sense
//! together (backend URL, bind address, timeouts, pool caps). Every problem is
//! collected so an operator sees the whole list at once.

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::ProxyConfig;
use crate::upstream::BackendTarget;

/// A single semantic problem in a [`ProxyConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("backend.url `{url}` is invalid: {reason}")]
    InvalidBackendUrl { url: String, reason: String },

    #[error("listener.bind_address `{0}` is not a socket address")]
    InvalidBindAddress(String),

    #[error("listener.max_connections must be greater than zero")]
    ZeroMaxConnections,

    #[error("listener.tls.{0} must not be empty")]
    MissingTlsPath(&'static str),

    #[error("timeouts.{0} must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error("pool.{0} must be greater than zero")]
    ZeroPoolCap(&'static str),

    #[error("pool.max_idle_conns_per_host ({per_host}) exceeds pool.max_idle_conns ({total})")]
    IdleCapsInverted { per_host: usize, total: usize },
}

/// Validate a parsed configuration, returning every problem found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if let Err(e) = BackendTarget::parse(&config.backend.url) {
        errors.push(ValidationError::InvalidBackendUrl {
            url: config.backend.url.clone(),
            reason: e.to_string(),
        });
    }

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidBindAddress(
            config.listener.bind_address.clone(),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::ZeroMaxConnections);
    }
    if config.listener.tls.cert_path.trim().is_empty() {
        errors.push(ValidationError::MissingTlsPath("cert_path"));
    }
    if config.listener.tls.key_path.trim().is_empty() {
        errors.push(ValidationError::MissingTlsPath("key_path"));
    }

    // keep_alive_ms = 0 is meaningful (disabled); the rest are deadlines.
    let t = &config.timeouts;
    for (name, value) in [
        ("dial_ms", t.dial_ms),
        ("idle_conn_ms", t.idle_conn_ms),
        ("tls_handshake_ms", t.tls_handshake_ms),
        ("read_ms", t.read_ms),
        ("write_ms", t.write_ms),
        ("idle_ms", t.idle_ms),
        ("drain_ms", t.drain_ms),
    ] {
        if value == 0 {
            errors.push(ValidationError::ZeroTimeout(name));
        }
    }

    if config.pool.max_idle_conns == 0 {
        errors.push(ValidationError::ZeroPoolCap("max_idle_conns"));
    }
    if config.pool.max_idle_conns_per_host == 0 {
        errors.push(ValidationError::ZeroPoolCap("max_idle_conns_per_host"));
    }
    if config.pool.max_idle_conns_per_host > config.pool.max_idle_conns {
        errors.push(ValidationError::IdleCapsInverted {
            per_host: config.pool.max_idle_conns_per_host,
            total: config.pool.max_idle_conns,
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
