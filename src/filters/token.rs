//! Shared-secret authentication with apache mimicry.
//!
//! Requests without the right `X-Lantern-Auth-Token` never learn they hit
//! a proxy: they get the page a default Apache would serve and the
//! connection is closed.

use async_trait::async_trait;

use crate::filters::{mimic, Filter, FilterDecision};
use crate::http::headers;
use crate::http::request::Request;
use crate::net::connection::RawConnection;
use crate::observability::metrics;

/// Outcome of checking a request's token header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenCheck {
    /// Authentication is disabled.
    Disabled,
    Matched,
    Missing,
    Mismatched,
}

pub struct TokenFilter {
    token: String,
}

impl TokenFilter {
    /// An empty token disables the check.
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }

    pub fn check(&self, req: &Request) -> TokenCheck {
        if self.token.is_empty() {
            return TokenCheck::Disabled;
        }
        let mut tokens = req.headers.get_all(headers::AUTH_TOKEN).iter().peekable();
        match tokens.peek() {
            None => return TokenCheck::Missing,
            Some(first) if first.is_empty() => return TokenCheck::Missing,
            Some(_) => {}
        }
        if tokens.any(|candidate| candidate.as_bytes() == self.token.as_bytes()) {
            TokenCheck::Matched
        } else {
            TokenCheck::Mismatched
        }
    }
}

#[async_trait]
impl Filter for TokenFilter {
    fn name(&self) -> &'static str {
        "token"
    }

    async fn apply(&self, conn: &mut RawConnection, mut req: Request) -> FilterDecision {
        tracing::trace!(connection_id = %conn.id(), request = ?req, "Token filter received request");

        match self.check(&req) {
            TokenCheck::Disabled => {
                tracing::trace!("Not checking token");
                FilterDecision::Continue(req)
            }
            TokenCheck::Matched => {
                req.headers.remove(headers::AUTH_TOKEN);
                tracing::trace!(
                    peer_addr = ?conn.peer_addr(),
                    host = %req.host(),
                    "Allowing connection"
                );
                metrics::record_mimic(false);
                FilterDecision::Continue(req)
            }
            failure => {
                tracing::warn!(
                    connection_id = %conn.id(),
                    peer_addr = ?conn.peer_addr(),
                    reason = ?failure,
                    "Token check failed, mimicking apache"
                );
                metrics::record_mimic(true);
                mimic::apache(conn, &req).await;
                FilterDecision::Hijack
            }
        }
    }
}
