//! Centralized forwarding error handling.
//!
//! Every failure the forwarder or a response modifier produces ends here.
//! The kind goes to the event sink; the client only ever sees a fixed 502.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderValue, Response, StatusCode};

use crate::observability::{EventSink, ProxyErrorEvent};
use crate::upstream::{ErrorKind, ForwardError};

pub const BAD_GATEWAY_BODY: &str = "Bad Gateway";

/// Turns forwarding failures into a 502 plus one structured event.
#[derive(Clone)]
pub struct ErrorHandler {
    sink: Arc<dyn EventSink>,
}

impl ErrorHandler {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    /// Record `err` and build the client response.
    ///
    /// `ClientDisconnected` reaches here when hyper fails the request on our
    /// side, usually because the client's request body broke mid-upload. The handler still has to return something, so it is
    /// an empty 502 with `Connection: close`: hyper drops it when the socket
    /// is already gone and never reuses the connection otherwise.
    pub fn handle(&self, err: &ForwardError, request_id: &str) -> Response<Body> {
        self.report(err, request_id);

        if err.kind() == ErrorKind::ClientDisconnected {
            let mut response = bad_gateway(Body::empty());
            response
                .headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
            return response;
        }
        let mut response = bad_gateway(Body::from(BAD_GATEWAY_BODY));
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }

    /// Record `err` without producing a response, for failures after the
    /// response head has already gone out.
    pub fn report(&self, err: &ForwardError, request_id: &str) {
        self.sink.record(&ProxyErrorEvent::from_error(err, request_id));
    }
}

fn bad_gateway(body: Body) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response
}
