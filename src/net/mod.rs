//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (tracking, idle timeout)
//!     → tls.rs (TLS handshake with the server config)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - Bounded accept prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - TLS is mandatory on the listener; plaintext is only spoken to the backend

pub mod connection;
pub mod listener;
pub mod tls;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker, IdleTimeout};
pub use listener::{ConnectionPermit, Listener, ListenerError};
pub use tls::TlsError;
