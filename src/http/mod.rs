//! HTTP/1.1 proxy front end.
//!
//! # Data Flow
//! ```text
//! TCP connection (net::listener)
//!     → server.rs   (per-connection loop, usage sample on close)
//!     → request.rs  (head parsing, body framing)
//!     → filters     (policy chain)
//!     → response.rs (synthetic replies) or upstream.rs (relay)
//! ```

pub mod headers;
pub mod request;
pub mod response;
pub mod server;
pub mod upstream;

pub use request::{read_request, BodyFraming, HeadError, Request};
pub use response::Reply;
pub use server::ProxyServer;
pub use upstream::{DirectUpstream, Upstream};
