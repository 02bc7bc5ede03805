//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum Router (health routes, proxy fallback, tracing)
//! - Run the accept loop and terminate TLS per connection
//! - Serve HTTP/1.1 and HTTP/2 on each connection
//! - Stop accepting and drain when the lifecycle leaves `Ready`

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, FromRef, State};
use axum::http::Request;
use axum::response::Response;
use axum::Router;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;

use crate::config::{ProxyConfig, TimeoutConfig};
use crate::health;
use crate::http::pipeline::Pipeline;
use crate::lifecycle::{drain, LifecycleController, StartupError};
use crate::net::tls::load_server_config;
use crate::net::{ConnectionPermit, ConnectionTracker, IdleTimeout, Listener, ListenerError};
use crate::observability::TracingSink;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub lifecycle: Arc<LifecycleController>,
}

impl FromRef<AppState> for Arc<LifecycleController> {
    fn from_ref(state: &AppState) -> Self {
        state.lifecycle.clone()
    }
}

/// HTTP server for the reverse proxy.
pub struct HttpServer {
    router: Router,
    tls: TlsAcceptor,
    config: ProxyConfig,
    pipeline: Arc<Pipeline>,
    lifecycle: Arc<LifecycleController>,
    tracker: ConnectionTracker,
}

impl HttpServer {
    /// Create a server that logs forwarding errors through `tracing`.
    pub fn new(config: ProxyConfig, lifecycle: Arc<LifecycleController>) -> Result<Self, StartupError> {
        let pipeline = Pipeline::from_config(&config, Arc::new(TracingSink))?;
        Self::with_pipeline(config, lifecycle, pipeline)
    }

    /// Create a server around an already-built pipeline. Loads TLS material.
    pub fn with_pipeline(
        config: ProxyConfig,
        lifecycle: Arc<LifecycleController>,
        pipeline: Pipeline,
    ) -> Result<Self, StartupError> {
        let tls = load_server_config(
            Path::new(&config.listener.tls.cert_path),
            Path::new(&config.listener.tls.key_path),
        )?;

        let pipeline = Arc::new(pipeline);
        let router = Self::build_router(AppState {
            pipeline: pipeline.clone(),
            lifecycle: lifecycle.clone(),
        });

        Ok(Self {
            router,
            tls: TlsAcceptor::from(tls),
            config,
            pipeline,
            lifecycle,
            tracker: ConnectionTracker::new(),
        })
    }

    /// Build the Axum router with all middleware layers.
    pub fn build_router(state: AppState) -> Router {
        Router::new()
            .merge(health::routes())
            .fallback(proxy_handler)
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Serve until shutdown begins, then close the listener and drain.
    pub async fn run(self, listener: Listener) -> Result<(), ListenerError> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(
                address = %addr,
                backend = %self.pipeline.target(),
                "HTTP server starting"
            );
        }

        let mut shutdown = self.lifecycle.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer, permit)) => self.spawn_connection(stream, peer, permit),
                    Err(ListenerError::Accept(err)) => {
                        // usually fd exhaustion; back off instead of spinning
                        tracing::warn!(error = %err, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    Err(err) => return Err(err),
                },
            }
        }

        drop(listener);
        tracing::info!(
            open_connections = self.tracker.active_count(),
            "Listener closed"
        );

        drain(&self.tracker, self.config.timeouts.drain(), &self.lifecycle).await;
        tracing::info!("HTTP server stopped");
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr, permit: ConnectionPermit) {
        let guard = self.tracker.track();
        let acceptor = self.tls.clone();
        let router = self.router.clone();
        let mut shutdown = self.lifecycle.subscribe();
        let timeouts = self.config.timeouts.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let id = guard.id();

            let stream = IdleTimeout::new(stream, timeouts.idle());
            let tls = match timeout(timeouts.read(), acceptor.accept(stream)).await {
                Ok(Ok(tls)) => tls,
                Ok(Err(err)) => {
                    tracing::debug!(connection_id = %id, peer_addr = %peer, error = %err, "TLS handshake failed");
                    return;
                }
                Err(_) => {
                    tracing::debug!(connection_id = %id, peer_addr = %peer, "TLS handshake timed out");
                    return;
                }
            };

            let service = service_fn(move |mut request: Request<Incoming>| {
                request.extensions_mut().insert(ConnectInfo(peer));
                router.clone().oneshot(request)
            });

            let builder = connection_builder(&timeouts);
            let conn = builder.serve_connection_with_upgrades(TokioIo::new(tls), service);
            tokio::pin!(conn);

            let result = tokio::select! {
                result = conn.as_mut() => result,
                _ = shutdown.recv() => {
                    conn.as_mut().graceful_shutdown();
                    conn.await
                }
            };

            if let Err(err) = result {
                tracing::debug!(connection_id = %id, peer_addr = %peer, error = %err, "Connection ended with error");
            }
            drop(guard);
        });
    }
}

fn connection_builder(timeouts: &TimeoutConfig) -> auto::Builder<TokioExecutor> {
    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(timeouts.read())
        .keep_alive(true);
    builder.http2().timer(TokioTimer::new());
    builder
}

/// Everything not matched by the health routes goes to the backend.
async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    state.pipeline.handle(request, peer).await
}
