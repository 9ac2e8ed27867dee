//! Synthetic responses written by the proxy itself.
//!
//! Replies carry no body; the proxy only ever answers with a status line,
//! a handful of headers and an optional close directive.

use http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};

/// Acknowledges a CONNECT request, as if the tunnel was established.
pub const TUNNEL_ESTABLISHED: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

/// A bodyless response the filter chain asks the server to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Close the connection after writing.
    pub close: bool,
}

impl Reply {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            close: false,
        }
    }

    /// A reply after which the connection is closed.
    pub fn closing(status: StatusCode) -> Self {
        Self {
            close: true,
            ..Self::new(status)
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Serialize as an HTTP/1.1 response.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason().unwrap_or("")
            )
            .as_bytes(),
        );
        if self.close {
            out.extend_from_slice(b"Connection: close\r\n");
        }
        for (name, value) in &self.headers {
            write_title_case(&mut out, name);
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        if !self.headers.contains_key(header::CONTENT_LENGTH) {
            out.extend_from_slice(b"Content-Length: 0\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// `location` becomes `Location`, `x-lantern-version` becomes `X-Lantern-Version`.
fn write_title_case(out: &mut Vec<u8>, name: &HeaderName) {
    let mut upper = true;
    for &b in name.as_str().as_bytes() {
        out.push(if upper { b.to_ascii_uppercase() } else { b });
        upper = b == b'-';
    }
}
