//! Proxy server: accept loop and per-connection request handling.
//!
//! # Responsibilities
//! - Accept connections within the listener's connection limit
//! - Read request heads and run them through the filter chain
//! - Write chain replies, hand admitted requests to the upstream
//! - Publish one usage sample per finished connection
//! - Stop accepting on shutdown

use std::sync::Arc;

use http::StatusCode;
use tokio::sync::broadcast;

use crate::filters::{FilterChain, FilterDecision};
use crate::http::headers;
use crate::http::request::{discard_body, read_request, HeadError};
use crate::http::response::Reply;
use crate::http::upstream::Upstream;
use crate::net::connection::{ConnectionTracker, RawConnection};
use crate::net::listener::{Listener, ListenerError};
use crate::usage::{UsageHandle, UsageSample};

/// Forward proxy with a policy filter chain in front of the upstream.
pub struct ProxyServer {
    chain: FilterChain,
    upstream: Arc<dyn Upstream>,
    usage: Option<UsageHandle>,
    connections: ConnectionTracker,
}

impl ProxyServer {
    pub fn new(chain: FilterChain, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            chain,
            upstream,
            usage: None,
            connections: ConnectionTracker::new(),
        }
    }

    /// Report per-device traffic of every finished connection.
    pub fn with_usage(mut self, usage: UsageHandle) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn active_connections(&self) -> u64 {
        self.connections.active_count()
    }

    /// Run the server until the shutdown signal fires.
    ///
    /// In-flight connections are not awaited; they finish on their own tasks.
    pub async fn run(
        self,
        listener: Listener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ListenerError> {
        let server = Arc::new(self);
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(
                address = %addr,
                filters = ?server.chain.names(),
                "Proxy server starting"
            );
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr, permit) = match accepted {
                        Ok(accepted) => accepted,
                        Err(ListenerError::Accept(e)) => {
                            tracing::warn!(error = %e, "Accept failed");
                            continue;
                        }
                        Err(e) => return Err(e),
                    };
                    let local_addr = stream.local_addr().ok();
                    let conn = RawConnection::new(stream).with_addrs(local_addr, Some(peer_addr));
                    let server = Arc::clone(&server);
                    tokio::spawn(async move {
                        server.serve_connection(conn).await;
                        drop(permit);
                    });
                }
                _ = shutdown.recv() => {
                    tracing::info!("Proxy server received shutdown signal, stopping accept loop");
                    break;
                }
            }
        }

        tracing::info!("Proxy server stopped");
        Ok(())
    }

    /// Handle one client connection to completion.
    pub async fn serve_connection(&self, mut conn: RawConnection) {
        let _guard = self.connections.track(conn.id());
        let mut device_id: Option<String> = None;
        let mut requests = 0u64;

        loop {
            let req = match read_request(conn.stream_mut()).await {
                Ok(req) => req,
                Err(HeadError::Eof) => break,
                Err(e) => {
                    tracing::debug!(connection_id = %conn.id(), error = %e, "Bad request head");
                    self.reject(&mut conn).await;
                    break;
                }
            };
            requests += 1;
            if requests == 1 {
                device_id = req.header_str(&headers::DEVICE_ID).map(str::to_string);
            }
            let framing = match req.body_framing() {
                Ok(framing) => framing,
                Err(e) => {
                    tracing::debug!(connection_id = %conn.id(), error = %e, "Bad body framing");
                    self.reject(&mut conn).await;
                    break;
                }
            };

            match self.chain.run(&mut conn, req).await {
                FilterDecision::Continue(req) => {
                    if let Err(e) = self.upstream.forward(&mut conn, req).await {
                        tracing::debug!(connection_id = %conn.id(), error = %e, "Upstream relay ended with error");
                    }
                    break;
                }
                FilterDecision::Reply(reply) => {
                    if let Err(e) = conn.write_all(&reply.to_bytes()).await {
                        tracing::debug!(connection_id = %conn.id(), error = %e, "Unable to write reply");
                        break;
                    }
                    if reply.close {
                        break;
                    }
                    if let Err(e) = discard_body(conn.stream_mut(), framing).await {
                        tracing::debug!(connection_id = %conn.id(), error = %e, "Unable to drain request body");
                        break;
                    }
                }
                FilterDecision::Hijack => break,
            }
        }

        conn.close().await;
        self.publish_usage(&conn, device_id);
    }

    async fn reject(&self, conn: &mut RawConnection) {
        let reply = Reply::closing(StatusCode::BAD_REQUEST);
        if let Err(e) = conn.write_all(&reply.to_bytes()).await {
            tracing::trace!(connection_id = %conn.id(), error = %e, "Unable to write rejection");
        }
    }

    fn publish_usage(&self, conn: &RawConnection, device_id: Option<String>) {
        let Some(usage) = &self.usage else {
            return;
        };
        let traffic = conn.traffic();
        usage.record(UsageSample {
            device_id,
            sent: traffic.sent(),
            recv: traffic.recv(),
        });
    }
}
