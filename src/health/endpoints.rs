//! Liveness and readiness handlers.

use std::sync::Arc;

use axum::extract::{FromRef, State};
use axum::http::StatusCode;
use axum::routing::any;
use axum::Router;

use crate::lifecycle::LifecycleController;

pub const HEALTHZ_PATH: &str = "/healthz";
pub const READYZ_PATH: &str = "/readyz";

/// Routes for `/healthz` and `/readyz`, for any state that can hand out the
/// lifecycle controller.
pub fn routes<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    Arc<LifecycleController>: FromRef<S>,
{
    Router::new()
        .route(HEALTHZ_PATH, any(healthz))
        .route(READYZ_PATH, any(readyz))
}

/// The process is up. True until exit, draining included.
async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn readyz(State(lifecycle): State<Arc<LifecycleController>>) -> (StatusCode, &'static str) {
    if lifecycle.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}
