//! Request heads: parsing, inspection and body framing.
//!
//! # Responsibilities
//! - Read one HTTP/1.x request head off a buffered stream
//! - Expose the pieces filters look at (method, target, host, headers)
//! - Determine and consume body framing
//! - Re-serialize the head in origin form for forwarding
//!
//! # Design Decisions
//! - Heads are capped at 32 KiB and 64 headers
//! - The body is never buffered; it stays on the connection until consumed
//! - The request target is kept verbatim so CONNECT targets can be
//!   validated by the filters rather than rejected by the parser

use std::io;

use http::{header, HeaderMap, HeaderName, HeaderValue, Method, Uri};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Maximum size of a request head in bytes.
pub const MAX_HEAD_BYTES: usize = 32 * 1024;

/// Maximum number of header fields in a request head.
pub const MAX_HEADERS: usize = 64;

const MAX_CHUNK_LINE: u64 = 4 * 1024;

/// Errors raised while reading a request head or its body.
#[derive(Debug, Error)]
pub enum HeadError {
    /// Peer closed the connection before sending anything.
    #[error("connection closed before a request was sent")]
    Eof,
    #[error("request head exceeds {0} bytes")]
    TooLarge(usize),
    #[error("malformed request head: {0}")]
    Parse(#[from] httparse::Error),
    #[error("invalid {0}")]
    Invalid(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// How the request body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
}

/// An inbound request head.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Request target exactly as sent: authority for CONNECT, origin or
    /// absolute form otherwise.
    pub target: String,
    /// HTTP/1 minor version.
    pub minor_version: u8,
    pub headers: HeaderMap,
}

impl Request {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            minor_version: 1,
            headers: HeaderMap::new(),
        }
    }

    /// Builder-style header append, mostly for tests and synthetic requests.
    pub fn with_header(mut self, name: HeaderName, value: &'static str) -> Self {
        self.headers.append(name, HeaderValue::from_static(value));
        self
    }

    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    /// The `host[:port]` this request is addressed to.
    ///
    /// CONNECT uses its target, absolute-form requests their authority and
    /// everything else the `Host` header.
    pub fn host(&self) -> &str {
        if self.is_connect() {
            return &self.target;
        }
        if let Some(authority) = absolute_authority(&self.target) {
            return authority;
        }
        self.header_str(&header::HOST).unwrap_or("")
    }

    /// [`Request::host`] without its port.
    pub fn hostname(&self) -> &str {
        strip_port(self.host())
    }

    /// Splits `host:port` the way a CONNECT target is expected to look.
    /// Returns `None` when there is no colon at all.
    pub fn split_target(&self) -> Option<(&str, &str)> {
        self.target.rsplit_once(':')
    }

    /// Path component of the target, `/` when there is none.
    pub fn path(&self) -> &str {
        let after_authority = match self.target.find("://") {
            Some(scheme_end) => {
                let rest = &self.target[scheme_end + 3..];
                rest.find('/').map(|i| &rest[i..]).unwrap_or("/")
            }
            None => self.target.as_str(),
        };
        let path = after_authority
            .split(['?', '#'])
            .next()
            .unwrap_or(after_authority);
        if path.starts_with('/') {
            path
        } else {
            "/"
        }
    }

    /// First value of a header, if present and valid UTF-8.
    pub fn header_str(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Body framing per RFC 9112 section 6.
    pub fn body_framing(&self) -> Result<BodyFraming, HeadError> {
        if let Some(te) = self.headers.get(header::TRANSFER_ENCODING) {
            let te = te.to_str().map_err(|_| HeadError::Invalid("transfer-encoding"))?;
            let last = te.rsplit(',').next().unwrap_or("").trim();
            if last.eq_ignore_ascii_case("chunked") {
                return Ok(BodyFraming::Chunked);
            }
            return Err(HeadError::Invalid("transfer-encoding"));
        }

        let mut lengths = self.headers.get_all(header::CONTENT_LENGTH).iter();
        let Some(first) = lengths.next() else {
            return Ok(BodyFraming::Empty);
        };
        let length = parse_content_length(first)?;
        for other in lengths {
            if parse_content_length(other)? != length {
                return Err(HeadError::Invalid("content-length"));
            }
        }
        Ok(if length == 0 {
            BodyFraming::Empty
        } else {
            BodyFraming::Length(length)
        })
    }

    /// Address to dial for this request, `host:port` with the scheme's
    /// default port filled in.
    pub fn upstream_addr(&self) -> Option<String> {
        if self.is_connect() {
            return Some(self.target.clone());
        }
        let default_port = if self.target.starts_with("https://") { 443 } else { 80 };
        let host = self.host();
        if host.is_empty() {
            return None;
        }
        let uri: Uri = format!("http://{}", host).parse().ok()?;
        let authority = uri.authority()?;
        let port = authority.port_u16().unwrap_or(default_port);
        Some(format!("{}:{}", authority.host(), port))
    }

    /// Serialize the head in origin form for sending upstream.
    pub fn write_origin_head(&self, out: &mut Vec<u8>) {
        let path_and_query = match self.target.find("://") {
            Some(scheme_end) => {
                let rest = &self.target[scheme_end + 3..];
                rest.find('/').map(|i| &rest[i..]).unwrap_or("/")
            }
            None => self.target.as_str(),
        };
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(path_and_query.as_bytes());
        out.extend_from_slice(format!(" HTTP/1.{}\r\n", self.minor_version).as_bytes());
        if !self.headers.contains_key(header::HOST) {
            out.extend_from_slice(b"host: ");
            out.extend_from_slice(self.host().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
    }
}

fn parse_content_length(value: &HeaderValue) -> Result<u64, HeadError> {
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .ok_or(HeadError::Invalid("content-length"))
}

fn absolute_authority(target: &str) -> Option<&str> {
    let rest = &target[target.find("://")? + 3..];
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    Some(&rest[..end])
}

fn strip_port(host: &str) -> &str {
    if let Some(bracketed) = host.strip_prefix('[') {
        return bracketed.split(']').next().unwrap_or(bracketed);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Read one request head from `reader`.
pub async fn read_request<R>(reader: &mut R) -> Result<Request, HeadError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    loop {
        let remaining = MAX_HEAD_BYTES.saturating_sub(buf.len());
        if remaining == 0 {
            return Err(HeadError::TooLarge(MAX_HEAD_BYTES));
        }
        let n = (&mut *reader)
            .take(remaining as u64)
            .read_until(b'\n', &mut buf)
            .await?;
        if n == 0 {
            return Err(if buf.is_empty() {
                HeadError::Eof
            } else {
                HeadError::Io(io::ErrorKind::UnexpectedEof.into())
            });
        }
        // Leading empty lines before the request line are ignored.
        if buf == b"\r\n" || buf == b"\n" {
            buf.clear();
            continue;
        }
        if buf.ends_with(b"\r\n\r\n") || buf.ends_with(b"\n\n") {
            break;
        }
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    if parsed.parse(&buf)?.is_partial() {
        return Err(HeadError::Invalid("request head"));
    }

    let method = parsed
        .method
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .ok_or(HeadError::Invalid("method"))?;
    let target = parsed.path.ok_or(HeadError::Invalid("request target"))?.to_string();
    let minor_version = parsed.version.ok_or(HeadError::Invalid("version"))?;

    let mut header_map = HeaderMap::with_capacity(parsed.headers.len());
    for h in parsed.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(|_| HeadError::Invalid("header name"))?;
        let value = HeaderValue::from_bytes(h.value).map_err(|_| HeadError::Invalid("header value"))?;
        header_map.append(name, value);
    }

    Ok(Request {
        method,
        target,
        minor_version,
        headers: header_map,
    })
}

/// Read and throw away a request body.
pub async fn discard_body<R>(reader: &mut R, framing: BodyFraming) -> Result<u64, HeadError>
where
    R: AsyncBufRead + Unpin,
{
    match framing {
        BodyFraming::Empty => Ok(0),
        BodyFraming::Length(length) => discard_exact(reader, length).await,
        BodyFraming::Chunked => {
            let mut total = 0;
            let mut line = Vec::new();
            loop {
                read_line(reader, &mut line).await?;
                let size_field = std::str::from_utf8(&line)
                    .ok()
                    .and_then(|l| l.split(';').next())
                    .map(str::trim)
                    .ok_or(HeadError::Invalid("chunk size"))?;
                let size = u64::from_str_radix(size_field, 16).map_err(|_| HeadError::Invalid("chunk size"))?;
                if size == 0 {
                    break;
                }
                total += discard_exact(reader, size).await?;
                read_line(reader, &mut line).await?;
                if !is_blank(&line) {
                    return Err(HeadError::Invalid("chunk terminator"));
                }
            }
            // Trailer section ends at the first empty line.
            loop {
                read_line(reader, &mut line).await?;
                if is_blank(&line) {
                    return Ok(total);
                }
            }
        }
    }
}

async fn discard_exact<R>(reader: &mut R, length: u64) -> Result<u64, HeadError>
where
    R: AsyncBufRead + Unpin,
{
    let copied = tokio::io::copy(&mut (&mut *reader).take(length), &mut tokio::io::sink()).await?;
    if copied != length {
        return Err(HeadError::Io(io::ErrorKind::UnexpectedEof.into()));
    }
    Ok(copied)
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>) -> Result<(), HeadError>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let n = (&mut *reader).take(MAX_CHUNK_LINE).read_until(b'\n', line).await?;
    if n == 0 || !line.ends_with(b"\n") {
        return Err(HeadError::Io(io::ErrorKind::UnexpectedEof.into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn parse(raw: &[u8]) -> Result<Request, HeadError> {
        let mut reader = BufReader::new(raw);
        read_request(&mut reader).await
    }

    #[tokio::test]
    async fn parses_connect_head() {
        let req = parse(b"CONNECT site.com:443 HTTP/1.1\r\nHost: site.com:443\r\nX-Lantern-Version: 3.0.0\r\n\r\n")
            .await
            .unwrap();
        assert!(req.is_connect());
        assert_eq!(req.target, "site.com:443");
        assert_eq!(req.host(), "site.com:443");
        assert_eq!(req.hostname(), "site.com");
        assert_eq!(req.split_target(), Some(("site.com", "443")));
        assert_eq!(req.header_str(&crate::http::headers::VERSION), Some("3.0.0"));
    }

    #[tokio::test]
    async fn keeps_unparsable_connect_port_for_filters() {
        let req = parse(b"CONNECT site.com:abc HTTP/1.1\r\n\r\n").await.unwrap();
        assert_eq!(req.split_target(), Some(("site.com", "abc")));
    }

    #[tokio::test]
    async fn repeated_headers_are_kept_in_order() {
        let req = parse(b"GET / HTTP/1.1\r\nHost: a\r\nX-Lantern-Auth-Token: one\r\nx-lantern-auth-token: two\r\n\r\n")
            .await
            .unwrap();
        let values: Vec<_> = req
            .headers
            .get_all(crate::http::headers::AUTH_TOKEN)
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(values, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn absolute_form_host_and_path() {
        let req = parse(b"GET http://example.com:8080/a/b?c=d HTTP/1.1\r\nHost: ignored\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(req.host(), "example.com:8080");
        assert_eq!(req.hostname(), "example.com");
        assert_eq!(req.path(), "/a/b");
        assert_eq!(req.upstream_addr().as_deref(), Some("example.com:8080"));

        let mut head = Vec::new();
        req.write_origin_head(&mut head);
        assert!(head.starts_with(b"GET /a/b?c=d HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn origin_form_uses_host_header() {
        let req = parse(b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n").await.unwrap();
        assert_eq!(req.hostname(), "example.com");
        assert_eq!(req.upstream_addr().as_deref(), Some("example.com:80"));
    }

    #[tokio::test]
    async fn eof_before_head() {
        assert!(matches!(parse(b"").await, Err(HeadError::Eof)));
        assert!(matches!(parse(b"GET / HTTP/1.1\r\n").await, Err(HeadError::Io(_))));
    }

    #[tokio::test]
    async fn oversized_head_rejected() {
        let mut raw = b"GET / HTTP/1.1\r\nX-Big: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEAD_BYTES));
        raw.extend_from_slice(b"\r\n\r\n");
        assert!(matches!(parse(&raw).await, Err(HeadError::TooLarge(_))));
    }

    #[tokio::test]
    async fn framing_rules() {
        let req = parse(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\n").await.unwrap();
        assert_eq!(req.body_framing().unwrap(), BodyFraming::Length(5));

        let req = parse(b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip, chunked\r\nContent-Length: 5\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(req.body_framing().unwrap(), BodyFraming::Chunked);

        let req = parse(b"POST / HTTP/1.1\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\n")
            .await
            .unwrap();
        assert!(req.body_framing().is_err());

        let req = parse(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        assert_eq!(req.body_framing().unwrap(), BodyFraming::Empty);
    }

    #[tokio::test]
    async fn discards_chunked_body_and_leaves_next_request() {
        let raw = b"4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\nTrailer: x\r\n\r\nGET /next HTTP/1.1\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let discarded = discard_body(&mut reader, BodyFraming::Chunked).await.unwrap();
        assert_eq!(discarded, 9);

        let next = read_request(&mut reader).await.unwrap();
        assert_eq!(next.path(), "/next");
    }

    #[tokio::test]
    async fn short_body_is_an_error() {
        let mut reader = BufReader::new(&b"abc"[..]);
        assert!(discard_body(&mut reader, BodyFraming::Length(10)).await.is_err());
    }
}
