//! Responses indistinguishable from a stock Apache install.
//!
//! Requests that fail authentication get exactly what an unconfigured
//! Apache 2.4 on Ubuntu sends for an unknown resource, so probing the
//! proxy's address looks like probing an ordinary web server.

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use http::uri::Authority;
use http::{header, Method};

use crate::http::request::Request;
use crate::net::connection::RawConnection;

/// `Server` header and `<address>` signature.
pub const SERVER_SIGNATURE: &str = "Apache/2.4.7 (Ubuntu)";

const DOCTYPE: &str = "<!DOCTYPE HTML PUBLIC \"-//IETF//DTD HTML 2.0//EN\">\n";

const KEEP_ALIVE: &str = "Keep-Alive: timeout=5, max=100\r\nConnection: Keep-Alive\r\n";

const CLOSE: &str = "Connection: close\r\n";

/// Render the Apache response for `req`.
///
/// The page footer names the host and port the client asked for, falling
/// back to `local`, the address the client connected to.
pub fn render(req: &Request, local: Option<SocketAddr>, now: DateTime<Utc>) -> Vec<u8> {
    let date = now.format("%a, %d %b %Y %H:%M:%S GMT");
    let address = footer(req, local);
    let method = &req.method;

    if *method == Method::OPTIONS {
        let connection = connection_headers(req);
        return format!(
            "HTTP/1.1 200 OK\r\nDate: {date}\r\nServer: {SERVER_SIGNATURE}\r\nAllow: GET,HEAD,POST,OPTIONS\r\nContent-Length: 0\r\n{connection}Content-Type: text/html\r\n\r\n"
        )
        .into_bytes();
    }

    // A 400 always drops the connection.
    let (status, body, connection) = if *method == Method::CONNECT {
        (
            "400 Bad Request",
            format!(
                "{DOCTYPE}<html><head>\n<title>400 Bad Request</title>\n</head><body>\n<h1>Bad Request</h1>\n<p>Your browser sent a request that this server could not understand.<br />\n</p>\n<hr>\n{address}</body></html>\n"
            ),
            CLOSE,
        )
    } else {
        (
            "404 Not Found",
            format!(
                "{DOCTYPE}<html><head>\n<title>404 Not Found</title>\n</head><body>\n<h1>Not Found</h1>\n<p>The requested URL {} was not found on this server.</p>\n<hr>\n{address}</body></html>\n",
                escape_html(req.path())
            ),
            connection_headers(req),
        )
    };

    let mut out = format!(
        "HTTP/1.1 {status}\r\nDate: {date}\r\nServer: {SERVER_SIGNATURE}\r\nContent-Length: {}\r\n{connection}Content-Type: text/html; charset=iso-8859-1\r\n\r\n",
        body.len()
    )
    .into_bytes();
    if *method != Method::HEAD {
        out.extend_from_slice(body.as_bytes());
    }
    out
}

/// HTTP/1.1 is persistent unless the client says `close`; HTTP/1.0 only
/// when it asks for `keep-alive`.
fn connection_headers(req: &Request) -> &'static str {
    let has_token = |token: &str| {
        req.headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    };
    let keep_alive = if req.minor_version >= 1 {
        !has_token("close")
    } else {
        has_token("keep-alive")
    };
    if keep_alive {
        KEEP_ALIVE
    } else {
        CLOSE
    }
}

fn footer(req: &Request, local: Option<SocketAddr>) -> String {
    let requested = req.host().parse::<Authority>().ok();
    let host = requested
        .as_ref()
        .map(|a| a.host().trim_start_matches('[').trim_end_matches(']').to_string())
        .filter(|h| !h.is_empty())
        .or_else(|| local.map(|addr| addr.ip().to_string()));
    let port = requested
        .as_ref()
        .and_then(Authority::port_u16)
        .or_else(|| local.map(|addr| addr.port()));
    match (host, port) {
        (Some(host), Some(port)) => format!("<address>{SERVER_SIGNATURE} Server at {host} Port {port}</address>\n"),
        _ => format!("<address>{SERVER_SIGNATURE} Server</address>\n"),
    }
}

/// Same escaping as `ap_escape_html`.
fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

/// Write the mimicked response to the client and close the connection.
pub async fn apache(conn: &mut RawConnection, req: &Request) {
    let response = render(req, conn.local_addr(), Utc::now());
    if let Err(e) = conn.write_all(&response).await {
        tracing::debug!(connection_id = %conn.id(), error = %e, "Failed to write mimicked response");
    }
    conn.close().await;
}
