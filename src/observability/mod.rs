//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Forwarding failures additionally produce:
//!     → events.rs (ProxyErrorEvent → EventSink)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Request ID flows through every error event
//! - The error sink is a trait object so tests can observe events directly

pub mod events;
pub mod logging;
pub mod metrics;

pub use events::{EventSink, MemorySink, ProxyErrorEvent, TracingSink};
pub use logging::init_logging;
