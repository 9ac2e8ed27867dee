//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout (plain or JSON lines)
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Events carry the connection id so one client's story can be grepped
//! - Metric updates are fire-and-forget; with no recorder installed they
//!   cost a branch

pub mod logging;
pub mod metrics;
