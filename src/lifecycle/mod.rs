//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validated config → filters → dialer → upstream → usage reporter → server
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Final usage flush → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then policies, then listeners
//! - Any startup error is fatal; a proxy with a half-built policy never
//!   accepts traffic

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::{build, Proxy, StartupError};
