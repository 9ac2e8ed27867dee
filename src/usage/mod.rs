//! Bandwidth accounting.
//!
//! # Data Flow
//! ```text
//! http/server.rs (connection closed, device id known)
//!     → reporter.rs  UsageHandle → channel → UsageReporter
//!     → store.rs     atomic increment + end-of-month expiry
//!     → tracker.rs   latest cumulative total per device
//! ```
//!
//! # Design Decisions
//! - Accounting is best effort: samples are dropped rather than delaying
//!   a connection, and failed writes are not retried
//! - Connections without a device id are not counted

pub mod reporter;
pub mod store;
pub mod tracker;

pub use reporter::{end_of_month, FlushPolicy, UsageHandle, UsageReporter, UsageSample};
pub use store::{Counters, MemoryStore, RedisStore, StoreError, UsageStore};
pub use tracker::{DeviceUsage, UsageTracker};
