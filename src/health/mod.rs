//! Health endpoints subsystem.
//!
//! # Data Flow
//! ```text
//! orchestrator probe
//!     → endpoints.rs (/healthz, /readyz)
//!     → LifecycleController::is_ready() (atomic load, no lock)
//! ```
//!
//! # Design Decisions
//! - Liveness is unconditional while the process runs
//! - Readiness mirrors the lifecycle state only; backend health is not probed
//! - Both routes answer any method

pub mod endpoints;

pub use endpoints::{routes, HEALTHZ_PATH, READYZ_PATH};
