//! CONNECT admission by destination port.

use std::collections::HashSet;

use async_trait::async_trait;
use http::StatusCode;

use crate::filters::{Filter, FilterDecision};
use crate::http::request::Request;
use crate::http::response::Reply;
use crate::net::connection::RawConnection;

/// Only lets CONNECT tunnels through to an allowed set of ports.
/// Other methods are not examined.
#[derive(Debug, Clone)]
pub struct TunnelPortsFilter {
    allowed_ports: HashSet<u16>,
}

impl TunnelPortsFilter {
    pub fn new(allowed_ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            allowed_ports: allowed_ports.into_iter().collect(),
        }
    }

    /// `Err` carries the status to reply with.
    pub fn check(&self, req: &Request) -> Result<(), StatusCode> {
        if !req.is_connect() {
            return Ok(());
        }
        let (_, port) = req.split_target().ok_or(StatusCode::BAD_REQUEST)?;
        if port.is_empty() {
            return Err(StatusCode::BAD_REQUEST);
        }
        let port: u16 = port.parse().map_err(|_| StatusCode::BAD_REQUEST)?;
        if !self.allowed_ports.contains(&port) {
            return Err(StatusCode::FORBIDDEN);
        }
        Ok(())
    }
}

#[async_trait]
impl Filter for TunnelPortsFilter {
    fn name(&self) -> &'static str {
        "tunnel_ports"
    }

    async fn apply(&self, conn: &mut RawConnection, req: Request) -> FilterDecision {
        match self.check(&req) {
            Ok(()) => FilterDecision::Continue(req),
            Err(status) => {
                tracing::debug!(
                    connection_id = %conn.id(),
                    target = %req.target,
                    status = status.as_u16(),
                    "Rejecting CONNECT"
                );
                FilterDecision::Reply(Reply::closing(status))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    fn connect(target: &str) -> Request {
        Request::new(Method::CONNECT, target)
    }

    fn filter() -> TunnelPortsFilter {
        TunnelPortsFilter::new([443, 8080])
    }

    #[test]
    fn malformed_targets_are_bad_requests() {
        for target in ["site.com", "site.com:", "site.com:abc", "site.com:99999"] {
            assert_eq!(filter().check(&connect(target)), Err(StatusCode::BAD_REQUEST), "{}", target);
        }
    }

    #[test]
    fn allowed_ports_pass() {
        assert_eq!(filter().check(&connect("site.com:443")), Ok(()));
        assert_eq!(filter().check(&connect("site.com:8080")), Ok(()));
    }

    #[test]
    fn other_ports_are_forbidden() {
        assert_eq!(filter().check(&connect("site.com:8081")), Err(StatusCode::FORBIDDEN));
    }

    #[test]
    fn non_connect_is_not_examined() {
        assert_eq!(filter().check(&Request::new(Method::GET, "site.com")), Ok(()));
    }

    #[tokio::test]
    async fn allowed_request_continues_unchanged() {
        let (_client, server) = tokio::io::duplex(64);
        let mut conn = RawConnection::new(server);
        let req = connect("site.com:443").with_header(http::header::HOST, "site.com:443");

        match filter().apply(&mut conn, req).await {
            FilterDecision::Continue(req) => {
                assert_eq!(req.target, "site.com:443");
                assert_eq!(req.header_str(&http::header::HOST), Some("site.com:443"));
            }
            other => panic!("expected continue, got {}", other.label()),
        }
    }

    #[tokio::test]
    async fn rejection_closes() {
        let (_client, server) = tokio::io::duplex(64);
        let mut conn = RawConnection::new(server);
        match filter().apply(&mut conn, connect("site.com:22")).await {
            FilterDecision::Reply(reply) => {
                assert_eq!(reply.status, StatusCode::FORBIDDEN);
                assert!(reply.close);
            }
            other => panic!("expected reply, got {}", other.label()),
        }
    }
}
