//! Raw client connections and lifecycle tracking.
//!
//! # Responsibilities
//! - Own the client transport so filters can write raw bytes and close it
//! - Buffer reads so request heads can be parsed in place
//! - Count bytes in both directions for usage accounting
//! - Track the number of live connections

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};

use crate::observability::metrics;

/// Any bidirectional byte stream a connection can be built on.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Bytes moved over a connection, seen from the proxy.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    sent: AtomicU64,
    recv: AtomicU64,
}

impl TrafficCounters {
    /// Bytes written to the client.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Bytes read from the client.
    pub fn recv(&self) -> u64 {
        self.recv.load(Ordering::Relaxed)
    }
}

/// Stream wrapper that feeds [`TrafficCounters`].
struct Metered<S> {
    inner: S,
    counters: Arc<TrafficCounters>,
}

impl<S: AsyncRead + Unpin> AsyncRead for Metered<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            let n = (buf.filled().len() - before) as u64;
            self.counters.recv.fetch_add(n, Ordering::Relaxed);
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Metered<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            self.counters.sent.fetch_add(n as u64, Ordering::Relaxed);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// The buffered, metered client stream.
pub type ClientStream = BufReader<Box<dyn Io>>;

/// The transport underneath one client request.
///
/// Filters that hijack a request write to it directly and close it; nothing
/// else touches the connection afterwards.
pub struct RawConnection {
    id: ConnectionId,
    stream: ClientStream,
    counters: Arc<TrafficCounters>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    closed: bool,
}

impl RawConnection {
    /// Wrap a client stream.
    pub fn new<S: Io + 'static>(stream: S) -> Self {
        let counters = Arc::new(TrafficCounters::default());
        let metered: Box<dyn Io> = Box::new(Metered {
            inner: stream,
            counters: Arc::clone(&counters),
        });
        Self {
            id: ConnectionId::new(),
            stream: BufReader::new(metered),
            counters,
            local_addr: None,
            peer_addr: None,
            closed: false,
        }
    }

    /// Attach socket addresses, used in logs and mimicked pages.
    pub fn with_addrs(mut self, local: Option<SocketAddr>, peer: Option<SocketAddr>) -> Self {
        self.local_addr = local;
        self.peer_addr = peer;
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn traffic(&self) -> &TrafficCounters {
        &self.counters
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The buffered stream, for reading request heads and relaying bytes.
    pub fn stream_mut(&mut self) -> &mut ClientStream {
        &mut self.stream
    }

    /// Write raw bytes to the client and flush them.
    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed"));
        }
        self.stream.write_all(buf).await?;
        self.stream.flush().await
    }

    /// Shut down the write half. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.stream.shutdown().await {
            tracing::trace!(connection_id = %self.id, error = %e, "Shutdown failed");
        }
    }
}

/// Tracks live connections for the active-connections gauge.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    active_count: Arc<AtomicU64>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new active connection. Returns a guard that decrements on drop.
    pub fn track(&self, id: ConnectionId) -> ConnectionGuard {
        let active = self.active_count.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::record_active_connections(active);
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            id,
        }
    }

    /// Get current active connection count.
    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements active count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    id: ConnectionId,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let active = self.active_count.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::record_active_connections(active);
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}
