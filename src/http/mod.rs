//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TLS connection
//!     → server.rs (accept loop, hyper connection, Axum router)
//!     → pipeline.rs (compose the stages below)
//!     → request.rs (X-Forwarded-For, rewrite, correlation ID, hop-by-hop)
//!     → [upstream forwarder]
//!     → response.rs (ResponseModifier) or error.rs (ErrorHandler → 502)
//!     → Send to client
//! ```

pub mod error;
pub mod pipeline;
pub mod request;
pub mod response;
pub mod server;

pub use error::ErrorHandler;
pub use pipeline::Pipeline;
pub use request::{X_FORWARDED_FOR, X_REQUEST_ID};
pub use response::{AgentHeader, ModifyError, ResponseModifier, VIA_VALUE};
pub use server::{AppState, HttpServer};
