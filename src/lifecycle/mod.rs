//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Validate → Load TLS → Bind → Serve
//!
//! Shutdown (controller.rs, shutdown.rs):
//!     Trigger → Ready→Draining → Stop accepting → Drain connections → Stopped
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → begin_drain()
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then TLS, then listeners
//! - Ordered shutdown: readiness off, stop accept, drain, close
//! - Shutdown has a timeout: in-flight work is not awaited past it

pub mod controller;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use controller::{LifecycleController, LifecycleState};
pub use shutdown::{drain, DrainOutcome, ShutdownSignal};
pub use startup::{launch, resolve_config, StartupError};
