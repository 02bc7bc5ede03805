//! Response post-processing.
//!
//! # Responsibilities
//! - Strip hop-by-hop headers from the backend response, keeping the
//!   trailer announcement so trailers still reach the client
//! - Mark the response with the proxy's agent header
//!
//! # Design Decisions
//! - Modifiers touch headers only; status and body pass through untouched
//! - Modification runs before the first byte is written to the client, so a
//!   failing modifier can still be answered with a clean 502

use axum::http::header::VIA;
use axum::http::{HeaderValue, Response};
use thiserror::Error;

use crate::http::request::strip_hop_by_hop;
use crate::upstream::UpstreamBody;

/// Agent marker set on every forwarded response.
pub const VIA_VALUE: &str = concat!("1.1 tls-relay/", env!("CARGO_PKG_VERSION"));

/// A modifier rejected the backend response.
#[derive(Debug, Error)]
#[error("response modifier failed: {reason}")]
pub struct ModifyError {
    reason: String,
}

impl ModifyError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Transformation applied to successful backend responses.
pub trait ResponseModifier: Send + Sync {
    fn modify(&self, response: Response<UpstreamBody>) -> Result<Response<UpstreamBody>, ModifyError>;
}

/// Default modifier: hop-by-hop cleanup plus the `Via` header.
#[derive(Debug, Default, Clone, Copy)]
pub struct AgentHeader;

impl ResponseModifier for AgentHeader {
    fn modify(&self, response: Response<UpstreamBody>) -> Result<Response<UpstreamBody>, ModifyError> {
        Ok(mark_agent(response))
    }
}

fn mark_agent<B>(mut response: Response<B>) -> Response<B> {
    let headers = response.headers_mut();
    strip_hop_by_hop(headers);
    headers.insert(VIA, HeaderValue::from_static(VIA_VALUE));
    response
}
