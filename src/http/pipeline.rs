//! The forwarding pipeline.
//!
//! ```text
//! request ─▶ X-Forwarded-For ─▶ rewrite ─▶ Forwarder ─▶ ResponseModifier ─▶ client
//!                                              │               │
//!                                              └──── error ────┴─▶ ErrorHandler ─▶ 502
//! ```
//!
//! Each stage is a plain function or trait object, so it can be tested on
//! its own; this module only composes them.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Request, Response};

use crate::config::ProxyConfig;
use crate::http::error::ErrorHandler;
use crate::http::request::{append_forwarded_for, request_id, rewrite};
use crate::http::response::{AgentHeader, ResponseModifier};
use crate::lifecycle::StartupError;
use crate::net::tls::backend_client_config;
use crate::observability::{metrics, EventSink};
use crate::upstream::{
    BackendTarget, ConnectionPool, Connector, ErrorKind, ForwardError, Forwarder, PoolSettings,
    StreamContext, UpstreamBody,
};

/// Director, forwarder, modifier, and error handler wired together.
pub struct Pipeline {
    forwarder: Forwarder,
    modifier: Arc<dyn ResponseModifier>,
    errors: ErrorHandler,
    write_timeout: Duration,
}

impl Pipeline {
    pub fn new(forwarder: Forwarder, errors: ErrorHandler, write_timeout: Duration) -> Self {
        Self {
            forwarder,
            modifier: Arc::new(AgentHeader),
            errors,
            write_timeout,
        }
    }

    /// Build the pipeline for the configured backend.
    pub fn from_config(config: &ProxyConfig, sink: Arc<dyn EventSink>) -> Result<Self, StartupError> {
        let target = Arc::new(BackendTarget::parse(&config.backend.url)?);
        let timeouts = &config.timeouts;

        let tls = backend_client_config(config.backend.ca_cert_path.as_deref().map(Path::new))?;
        let connector = Connector::new(
            tls,
            timeouts.dial(),
            timeouts.tls_handshake(),
            timeouts.keep_alive(),
        );
        let pool = ConnectionPool::new(
            PoolSettings::from_config(&config.pool, timeouts),
            connector,
        );

        tracing::info!(
            backend = %target,
            max_idle_conns = config.pool.max_idle_conns,
            max_idle_conns_per_host = config.pool.max_idle_conns_per_host,
            "Backend configured"
        );

        Ok(Self::new(
            Forwarder::new(pool, target, timeouts.read()),
            ErrorHandler::new(sink),
            timeouts.write(),
        ))
    }

    /// Replace the response modifier.
    pub fn with_modifier(mut self, modifier: Arc<dyn ResponseModifier>) -> Self {
        self.modifier = modifier;
        self
    }

    pub fn pool(&self) -> &ConnectionPool {
        self.forwarder.pool()
    }

    pub fn target(&self) -> &BackendTarget {
        self.forwarder.target()
    }

    /// Run one request through every stage. Never fails: errors become a 502.
    pub async fn handle(&self, mut request: Request<Body>, peer: Option<SocketAddr>) -> Response<Body> {
        let start = Instant::now();

        append_forwarded_for(&mut request, peer);
        let request = rewrite(request, self.target());

        let ctx = StreamContext {
            method: request.method().clone(),
            url: request.uri().clone(),
            request_id: request_id(&request).unwrap_or_default().to_owned(),
            errors: self.errors.clone(),
            deadline: tokio::time::Instant::now() + self.write_timeout,
        };

        let guard = DisconnectGuard::arm(&ctx);
        let forwarded = self.forwarder.forward(request, ctx.clone()).await;
        guard.disarm();

        let response = match forwarded.and_then(|response| self.modify(response, &ctx)) {
            Ok(response) => response.map(Body::new),
            Err(err) => self.errors.handle(&err, &ctx.request_id),
        };

        metrics::record_request(ctx.method.as_str(), response.status().as_u16(), start);
        response
    }

    fn modify(
        &self,
        response: Response<UpstreamBody>,
        ctx: &StreamContext,
    ) -> Result<Response<UpstreamBody>, ForwardError> {
        self.modifier.modify(response).map_err(|err| {
            ForwardError::new(
                ErrorKind::MalformedUpstreamResponse,
                ctx.method.clone(),
                ctx.url.clone(),
                err,
            )
        })
    }
}

/// Reports `ClientDisconnected` if the request future is dropped before the
/// backend answered.
struct DisconnectGuard<'a> {
    ctx: &'a StreamContext,
    armed: bool,
}

impl<'a> DisconnectGuard<'a> {
    fn arm(ctx: &'a StreamContext) -> Self {
        Self { ctx, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for DisconnectGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let err = ForwardError::new(
            ErrorKind::ClientDisconnected,
            self.ctx.method.clone(),
            self.ctx.url.clone(),
            "client went away before the backend answered",
        );
        self.ctx.errors.report(&err, &self.ctx.request_id);
    }
}
