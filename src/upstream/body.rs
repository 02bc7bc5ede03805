//! Streaming response body bound to its pooled connection.
//!
//! The backend body is relayed frame by frame; nothing is buffered. The
//! connection rides along with the body and goes back to the pool only once
//! the backend signals end of stream. Errors, timeouts, and early drops (the
//! client went away) all close it.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::http::{Method, Uri};
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use tokio::time::{sleep, sleep_until, Instant, Sleep};

use crate::http::error::ErrorHandler;
use crate::upstream::error::{classify_hyper, BoxError, ErrorKind, ForwardError};
use crate::upstream::pool::{ConnectionPool, PooledConnection};

/// What a streaming body needs to report failures after the head is sent.
#[derive(Clone)]
pub struct StreamContext {
    pub method: Method,
    pub url: Uri,
    pub request_id: String,
    pub errors: ErrorHandler,
    /// Deadline for the whole response to be written to the client.
    pub deadline: Instant,
}

struct Lease {
    pool: ConnectionPool,
    conn: PooledConnection,
}

/// Backend response body relayed to the client.
pub struct UpstreamBody {
    inner: Incoming,
    lease: Option<Lease>,
    ctx: StreamContext,
    read_timeout: Duration,
    /// Backend silence timer, armed while waiting for the next frame.
    idle: Pin<Box<Sleep>>,
    deadline: Pin<Box<Sleep>>,
    awaiting: bool,
    started: bool,
    done: bool,
}

impl UpstreamBody {
    pub(crate) fn new(
        inner: Incoming,
        pool: ConnectionPool,
        conn: PooledConnection,
        ctx: StreamContext,
        read_timeout: Duration,
    ) -> Self {
        let deadline = Box::pin(sleep_until(ctx.deadline));
        Self {
            inner,
            lease: Some(Lease { pool, conn }),
            ctx,
            read_timeout,
            idle: Box::pin(sleep(read_timeout)),
            deadline,
            awaiting: false,
            started: false,
            done: false,
        }
    }

    fn finish(&mut self) {
        self.done = true;
        if let Some(lease) = self.lease.take() {
            lease.pool.release(lease.conn, true);
        }
    }

    fn fail(&mut self, kind: ErrorKind, cause: impl Into<BoxError>) -> ForwardError {
        self.done = true;
        if let Some(lease) = self.lease.take() {
            lease.pool.release(lease.conn, false);
        }

        let err = ForwardError::new(kind, self.ctx.method.clone(), self.ctx.url.clone(), cause);
        self.ctx.errors.report(&err, &self.ctx.request_id);
        err
    }
}

impl Body for UpstreamBody {
    type Data = Bytes;
    type Error = ForwardError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, ForwardError>>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        this.started = true;

        if this.deadline.as_mut().poll(cx).is_ready() {
            let err = this.fail(ErrorKind::BackendTimeout, "response write deadline exceeded");
            return Poll::Ready(Some(Err(err)));
        }

        // only time the backend, not a slow client
        if !this.awaiting {
            this.awaiting = true;
            let next = Instant::now() + this.read_timeout;
            this.idle.as_mut().reset(next);
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                this.awaiting = false;
                if this.inner.is_end_stream() {
                    this.finish();
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(err))) => {
                let kind = classify_hyper(&err);
                Poll::Ready(Some(Err(this.fail(kind, err))))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => {
                if this.idle.as_mut().poll(cx).is_ready() {
                    let err = this.fail(ErrorKind::BackendTimeout, "backend read timed out");
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Pending
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for UpstreamBody {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };

        if self.inner.is_end_stream() {
            lease.pool.release(lease.conn, true);
            return;
        }

        // partially read: the connection state is unknown
        lease.pool.release(lease.conn, false);
        if self.started {
            let err = ForwardError::new(
                ErrorKind::ClientDisconnected,
                self.ctx.method.clone(),
                self.ctx.url.clone(),
                "client went away mid-stream",
            );
            self.ctx.errors.report(&err, &self.ctx.request_id);
        }
    }
}
