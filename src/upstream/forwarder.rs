//! One round trip to the backend.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::uri::PathAndQuery;
use axum::http::{Request, Response, Uri, Version};
use tokio::time::timeout;

use crate::upstream::body::{StreamContext, UpstreamBody};
use crate::upstream::error::{classify_hyper, ErrorKind, ForwardError};
use crate::upstream::pool::{ConnectionPool, PooledConnection};
use crate::upstream::target::BackendTarget;

/// Sends rewritten requests to the backend over pooled connections.
///
/// Never retries: a request that reached the backend and failed is surfaced
/// as-is. The only loop is over stale idle connections, before anything has
/// been written.
#[derive(Clone)]
pub struct Forwarder {
    pool: ConnectionPool,
    target: Arc<BackendTarget>,
    read_timeout: Duration,
}

impl Forwarder {
    pub fn new(pool: ConnectionPool, target: Arc<BackendTarget>, read_timeout: Duration) -> Self {
        Self {
            pool,
            target,
            read_timeout,
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn target(&self) -> &BackendTarget {
        &self.target
    }

    /// Forward `request` and return the backend's response with a streaming body.
    ///
    /// The response head must arrive within the read timeout. On any failure
    /// the connection is closed, never pooled.
    pub async fn forward(
        &self,
        request: Request<Body>,
        ctx: StreamContext,
    ) -> Result<Response<UpstreamBody>, ForwardError> {
        let mut conn = self.checkout(&ctx).await?;
        let conn_id = conn.id();

        tracing::debug!(
            request_id = %ctx.request_id,
            connection_id = conn_id,
            reused = conn.is_reused(),
            "Forwarding request"
        );

        let request = into_origin_form(request);
        match timeout(self.read_timeout, conn.send_request(request)).await {
            Ok(Ok(response)) => {
                let pool = self.pool.clone();
                let read_timeout = self.read_timeout;
                Ok(response.map(move |incoming| {
                    UpstreamBody::new(incoming, pool, conn, ctx, read_timeout)
                }))
            }
            Ok(Err(err)) => {
                self.pool.release(conn, false);
                Err(ForwardError::new(classify_hyper(&err), ctx.method, ctx.url, err))
            }
            Err(elapsed) => {
                tracing::debug!(connection_id = conn_id, "Backend response head timed out");
                self.pool.release(conn, false);
                Err(ForwardError::new(ErrorKind::BackendTimeout, ctx.method, ctx.url, elapsed))
            }
        }
    }

    async fn checkout(&self, ctx: &StreamContext) -> Result<PooledConnection, ForwardError> {
        loop {
            let mut conn = self
                .pool
                .acquire(&self.target)
                .await
                .map_err(|e| ForwardError::connect(e, ctx.method.clone(), ctx.url.clone()))?;

            match conn.ready().await {
                Ok(()) => return Ok(conn),
                Err(err) if conn.is_reused() => {
                    tracing::debug!(connection_id = conn.id(), error = %err, "Discarding stale backend connection");
                    self.pool.release(conn, false);
                }
                Err(err) => {
                    self.pool.release(conn, false);
                    return Err(ForwardError::new(
                        ErrorKind::BackendConnectionReset,
                        ctx.method.clone(),
                        ctx.url.clone(),
                        err,
                    ));
                }
            }
        }
    }
}

/// HTTP/1.1 request line wants origin-form: path and query only.
fn into_origin_form<B>(mut request: Request<B>) -> Request<B> {
    let path = request
        .uri()
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    *request.uri_mut() = Uri::from(path);
    *request.version_mut() = Version::HTTP_11;
    request
}
