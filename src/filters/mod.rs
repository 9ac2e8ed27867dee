//! Request policy filters.
//!
//! # Data Flow
//! ```text
//! Request head parsed by the server
//!     → token.rs          (shared secret, apache mimicry on failure)
//!     → tunnel_ports.rs   (CONNECT port admission)
//!     → version_check.rs  (upgrade redirects, CONNECT hijack)
//!     → upstream
//! ```
//!
//! # Design Decisions
//! - Every filter returns exactly one [`FilterDecision`]
//! - `Reply` is written by the server; `Hijack` means the filter already
//!   wrote to and closed the raw connection itself
//! - Filters hold only immutable policy and are shared across connections

use std::sync::Arc;

use async_trait::async_trait;

use crate::http::request::Request;
use crate::http::response::Reply;
use crate::net::connection::RawConnection;
use crate::observability::metrics;

pub mod mimic;
pub mod token;
pub mod tunnel_ports;
pub mod version_check;

pub use token::TokenFilter;
pub use tunnel_ports::TunnelPortsFilter;
pub use version_check::VersionChecker;

/// Outcome of one filter invocation.
#[derive(Debug)]
pub enum FilterDecision {
    /// Hand the (possibly modified) request to the next filter.
    Continue(Request),
    /// Stop here; the server writes this reply.
    Reply(Reply),
    /// Stop here; the filter owns the connection and has terminated it.
    Hijack,
}

impl FilterDecision {
    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            FilterDecision::Continue(_) => "continue",
            FilterDecision::Reply(_) => "reply",
            FilterDecision::Hijack => "hijack",
        }
    }
}

/// A policy step applied to every request head.
#[async_trait]
pub trait Filter: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Inspect `req`, possibly taking over `conn`.
    async fn apply(&self, conn: &mut RawConnection, req: Request) -> FilterDecision;
}

/// Runs filters in order until one of them stops the request.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn push(&mut self, filter: Arc<dyn Filter>) {
        self.filters.push(filter);
    }

    /// Names of the configured filters, in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    pub async fn run(&self, conn: &mut RawConnection, mut req: Request) -> FilterDecision {
        for filter in &self.filters {
            let decision = filter.apply(conn, req).await;
            metrics::record_filter_decision(filter.name(), decision.label());
            match decision {
                FilterDecision::Continue(next) => req = next,
                stop => {
                    tracing::debug!(
                        connection_id = %conn.id(),
                        filter = filter.name(),
                        decision = stop.label(),
                        "Filter chain stopped"
                    );
                    return stop;
                }
            }
        }
        FilterDecision::Continue(req)
    }
}
