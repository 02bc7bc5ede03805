//! Upstream (backend) subsystem.
//!
//! # Data Flow
//! ```text
//! rewritten request
//!     → forwarder.rs (checkout, send, bound the response head)
//!     → pool.rs (idle reuse or dial via connector.rs)
//!     → body.rs (stream the response, release the connection at EOS)
//! ```
//!
//! # Design Decisions
//! - One fixed target, parsed once (target.rs)
//! - Every failure is classified into an `ErrorKind` (error.rs)
//! - A connection is owned by exactly one exchange while checked out

pub mod body;
pub mod connector;
pub mod error;
pub mod forwarder;
pub mod pool;
pub mod target;

pub use body::{StreamContext, UpstreamBody};
pub use connector::{BackendStream, Connector};
pub use error::{ConnectError, ErrorKind, ForwardError};
pub use forwarder::Forwarder;
pub use pool::{ConnectionPool, PoolSettings, PooledConnection};
pub use target::{BackendTarget, PoolKey, TargetError};
