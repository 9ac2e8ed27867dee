//! Policy filters for a forward HTTP/CONNECT proxy.
//!
//! Every inbound request passes a chain of filters before it reaches the
//! upstream: shared-secret authentication disguised as a stock Apache
//! server, CONNECT port admission, and redirection of outdated clients to
//! an upgrade page. Finished connections are metered per device and
//! flushed periodically to a shared store.

// Core subsystems
pub mod config;
pub mod filters;
pub mod http;
pub mod net;
pub mod usage;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::schema::ProxyConfig;
pub use filters::{Filter, FilterChain, FilterDecision};
pub use http::ProxyServer;
pub use lifecycle::Shutdown;
