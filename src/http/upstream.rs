//! Forwarding admitted requests.
//!
//! # Responsibilities
//! - Dial the request's destination through the configured [`Dialer`]s
//! - CONNECT: dial raw TCP, acknowledge, then splice client and destination
//!   together
//! - Everything else: dial through the forward dialer, send the head in
//!   origin form, then splice
//!
//! One request per connection: the upstream is told `Connection: close`
//! and the relay runs until both sides are done.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use http::{header, HeaderValue, StatusCode};
use tokio::io::AsyncWriteExt;

use crate::http::headers;
use crate::http::request::Request;
use crate::http::response::{Reply, TUNNEL_ESTABLISHED};
use crate::net::connection::RawConnection;
use crate::net::dial::Dialer;

/// Where requests go once every filter has let them through.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Serve `req` to completion. The connection is closed on return.
    async fn forward(&self, conn: &mut RawConnection, req: Request) -> io::Result<()>;
}

/// Connects straight to the requested destination.
///
/// Tunnels carry the client's own protocol and always go through the raw
/// dialer. Forwarded requests may use a different one, e.g. one that speaks
/// TLS to particular destinations.
#[derive(Clone)]
pub struct DirectUpstream {
    tunnel_dialer: Arc<dyn Dialer>,
    forward_dialer: Arc<dyn Dialer>,
}

impl DirectUpstream {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            forward_dialer: Arc::clone(&dialer),
            tunnel_dialer: dialer,
        }
    }

    /// Dial forwarded (non-CONNECT) requests through `dialer`.
    pub fn with_forward_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.forward_dialer = dialer;
        self
    }
}

#[async_trait]
impl Upstream for DirectUpstream {
    async fn forward(&self, conn: &mut RawConnection, mut req: Request) -> io::Result<()> {
        let Some(addr) = req.upstream_addr() else {
            conn.write_all(&Reply::closing(StatusCode::BAD_REQUEST).to_bytes()).await?;
            conn.close().await;
            return Ok(());
        };

        let dialer = if req.is_connect() {
            &self.tunnel_dialer
        } else {
            &self.forward_dialer
        };
        let mut upstream = match dialer.dial(&addr).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(connection_id = %conn.id(), addr = %addr, error = %e, "Upstream dial failed");
                conn.write_all(&Reply::closing(StatusCode::BAD_GATEWAY).to_bytes()).await?;
                conn.close().await;
                return Ok(());
            }
        };

        if req.is_connect() {
            conn.write_all(TUNNEL_ESTABLISHED).await?;
        } else {
            req.headers.remove(headers::PROXY_CONNECTION);
            req.headers.remove(headers::DEVICE_ID);
            req.headers.remove(header::PROXY_AUTHORIZATION);
            req.headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
            let mut head = Vec::with_capacity(512);
            req.write_origin_head(&mut head);
            upstream.write_all(&head).await?;
        }

        tracing::debug!(
            connection_id = %conn.id(),
            method = %req.method,
            addr = %addr,
            "Relaying to upstream"
        );
        let relayed = tokio::io::copy_bidirectional(conn.stream_mut(), &mut upstream).await;
        conn.close().await;
        let (to_upstream, to_client) = relayed?;
        tracing::trace!(connection_id = %conn.id(), to_upstream, to_client, "Relay finished");
        Ok(())
    }
}
