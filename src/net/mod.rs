//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (RawConnection: buffered, metered, hijackable)
//!     → Hand off to the filter chain
//!
//! Outgoing connection
//!     → dial.rs (Dialer, optionally wrapped to speak TLS)
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Filters own the raw connection once they hijack it
//! - Outbound dialing is a trait so policies can decorate it

pub mod connection;
pub mod dial;
pub mod listener;

pub use connection::{ConnectionId, Io, RawConnection};
pub use dial::{Dialer, TcpDialer};
pub use listener::Listener;
