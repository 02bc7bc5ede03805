//! Structured proxy error events.

use std::sync::Mutex;

use crate::observability::metrics;
use crate::upstream::{ErrorKind, ForwardError};

/// One forwarding failure, as handed to the observability sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyErrorEvent {
    pub kind: ErrorKind,
    pub method: String,
    pub url: String,
    pub request_id: String,
    pub detail: String,
}

impl ProxyErrorEvent {
    pub fn from_error(err: &ForwardError, request_id: &str) -> Self {
        Self {
            kind: err.kind(),
            method: err.method().to_string(),
            url: err.url().to_string(),
            request_id: request_id.to_string(),
            detail: err.cause().to_string(),
        }
    }
}

/// Receiver of proxy error events.
pub trait EventSink: Send + Sync {
    fn record(&self, event: &ProxyErrorEvent);
}

/// Production sink: a log line plus the upstream error counter.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: &ProxyErrorEvent) {
        if event.kind == ErrorKind::ClientDisconnected {
            tracing::warn!(
                kind = %event.kind,
                method = %event.method,
                url = %event.url,
                request_id = %event.request_id,
                detail = %event.detail,
                "Client disconnected"
            );
        } else {
            tracing::error!(
                kind = %event.kind,
                transient = event.kind.is_transient(),
                method = %event.method,
                url = %event.url,
                request_id = %event.request_id,
                detail = %event.detail,
                "Upstream request failed"
            );
        }
        metrics::record_upstream_error(event.kind);
    }
}

/// Sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<ProxyErrorEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far.
    pub fn events(&self) -> Vec<ProxyErrorEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: &ProxyErrorEvent) {
        let mut events = self
            .events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        events.push(event.clone());
    }
}
