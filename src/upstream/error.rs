//! Forwarding error taxonomy.
//!
//! Every failure between dispatch and the last response byte is classified
//! into one [`ErrorKind`]. The kind drives logs and metrics only; the client
//! always sees the same 502.

use std::fmt;
use std::io;

use axum::http::{Method, Uri};
use thiserror::Error;

use crate::upstream::target::PoolKey;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Classification of a forwarding failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// TCP connect to the backend did not finish within the dial timeout.
    DialTimeout,
    /// TCP connect to the backend failed outright.
    DialRefused,
    /// TLS handshake with an https backend failed or timed out.
    TlsHandshakeFailed,
    /// The backend went silent past a configured read/write timeout.
    BackendTimeout,
    /// The backend connection broke mid-exchange.
    BackendConnectionReset,
    /// The backend sent something that is not a usable HTTP response.
    MalformedUpstreamResponse,
    /// The client went away; nothing is written back.
    ClientDisconnected,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::DialTimeout => "dial_timeout",
            ErrorKind::DialRefused => "dial_refused",
            ErrorKind::TlsHandshakeFailed => "tls_handshake_failed",
            ErrorKind::BackendTimeout => "backend_timeout",
            ErrorKind::BackendConnectionReset => "backend_connection_reset",
            ErrorKind::MalformedUpstreamResponse => "malformed_upstream_response",
            ErrorKind::ClientDisconnected => "client_disconnected",
        }
    }

    /// Whether the failure is likely to clear up on its own, as opposed to
    /// pointing at a configuration problem (wrong port, bad certificate).
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            ErrorKind::DialRefused
                | ErrorKind::TlsHandshakeFailed
                | ErrorKind::MalformedUpstreamResponse
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure to obtain a backend connection from the pool.
#[derive(Debug, Error)]
#[error("{kind} connecting to {key}")]
pub struct ConnectError {
    kind: ErrorKind,
    key: PoolKey,
    #[source]
    source: BoxError,
}

impl ConnectError {
    pub fn new(kind: ErrorKind, key: PoolKey, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            key,
            source: source.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

/// A failed round trip, carrying what the error handler needs to log it.
#[derive(Debug, Error)]
#[error("{kind} forwarding {method} {url}")]
pub struct ForwardError {
    kind: ErrorKind,
    method: Method,
    url: Uri,
    #[source]
    source: BoxError,
}

impl ForwardError {
    pub fn new(kind: ErrorKind, method: Method, url: Uri, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            method,
            url,
            source: source.into(),
        }
    }

    pub fn connect(err: ConnectError, method: Method, url: Uri) -> Self {
        Self::new(err.kind(), method, url, err)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Uri {
        &self.url
    }

    /// The underlying cause, for logging.
    pub fn cause(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.source.as_ref()
    }
}

/// Classify a failed TCP connect.
pub(crate) fn classify_dial(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::TimedOut => ErrorKind::DialTimeout,
        _ => ErrorKind::DialRefused,
    }
}

/// Classify a hyper client error raised while exchanging with the backend.
pub(crate) fn classify_hyper(err: &hyper::Error) -> ErrorKind {
    if err.is_timeout() {
        ErrorKind::BackendTimeout
    } else if err.is_parse() {
        ErrorKind::MalformedUpstreamResponse
    } else if err.is_user() {
        // the request body we were streaming upstream failed: the client is gone
        ErrorKind::ClientDisconnected
    } else {
        ErrorKind::BackendConnectionReset
    }
}
