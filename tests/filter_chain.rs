//! End-to-end behaviour of the filter chain over real sockets.

use policy_proxy::config::FilterKind;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

mod common;

const REWRITE_URL: &str = "http://update.example.com/upgrade";

#[tokio::test]
async fn connect_port_admission() {
    let echo = common::start_echo_backend().await;
    let mut config = common::open_config();
    config.tunnel_ports.allowed_ports = vec![echo.port()];
    let proxy = common::start_proxy(config).await;

    for target in ["site.example", "site.example:", "site.example:http"] {
        let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
        let response = common::send_raw(proxy.addr, request.as_bytes()).await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{target}: {response}");
    }

    let response = common::send_raw(proxy.addr, b"CONNECT site.example:25 HTTP/1.1\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 403 Forbidden\r\n"));
    assert!(response.contains("Connection: close\r\n"));

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    let request = format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    assert_eq!(common::read_exact(&mut stream, 19).await, b"HTTP/1.1 200 OK\r\n\r\n");
    stream.write_all(b"ping").await.unwrap();
    assert_eq!(common::read_exact(&mut stream, 4).await, b"ping");

    proxy.shutdown.trigger();
}

#[tokio::test]
async fn non_connect_ignores_port_policy() {
    let backend = common::start_mock_backend("hello").await;
    let mut config = common::open_config();
    config.tunnel_ports.allowed_ports = vec![443];
    let proxy = common::start_proxy(config).await;

    let request = format!("GET http://{backend}/ HTTP/1.1\r\nHost: {backend}\r\n\r\n");
    let response = common::send_raw(proxy.addr, request.as_bytes()).await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("hello"));
}

#[tokio::test]
async fn unauthenticated_probe_sees_apache() {
    let backend = common::start_mock_backend("secret stuff").await;
    let mut config = common::open_config();
    config.token.token = "s3cret".into();
    config.tunnel_ports.allowed_ports = vec![443];
    let proxy = common::start_proxy(config).await;

    // Token runs before port admission, so a probe never sees a 403.
    let response = common::send_raw(proxy.addr, b"CONNECT site.example:25 HTTP/1.1\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(response.contains("Server: Apache/2.4.7 (Ubuntu)\r\n"));

    let request = format!("GET http://{backend}/admin HTTP/1.1\r\nHost: {backend}\r\nX-Lantern-Auth-Token: guess\r\n\r\n");
    let response = common::send_raw(proxy.addr, request.as_bytes()).await;
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(response.contains("The requested URL /admin was not found on this server."));
    assert!(response.contains("\r\nKeep-Alive: timeout=5, max=100\r\nConnection: Keep-Alive\r\n"));
    assert!(response.contains(&format!("Server at {} Port {}</address>", backend.ip(), backend.port())));
    assert!(!response.contains("secret stuff"));

    let request = format!("GET http://{backend}/ HTTP/1.1\r\nHost: {backend}\r\nX-Lantern-Auth-Token: s3cret\r\n\r\n");
    let response = common::send_raw(proxy.addr, request.as_bytes()).await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("secret stuff"));
}

fn version_config() -> policy_proxy::ProxyConfig {
    let mut config = common::open_config();
    config.tunnel_ports.allowed_ports = vec![80, 443];
    config.version_check.enabled = true;
    config.version_check.range = ">=3.0.0".into();
    config.version_check.rewrite_url = REWRITE_URL.into();
    config.version_check.redirect_percentage = 100.0;
    config.filters.order = vec![FilterKind::Token, FilterKind::TunnelPorts, FilterKind::VersionCheck];
    config
}

#[tokio::test]
async fn outdated_browser_get_is_redirected() {
    let proxy = common::start_proxy(version_config()).await;

    let response = common::send_raw(
        proxy.addr,
        b"GET http://site.example/ HTTP/1.1\r\nHost: site.example\r\n\
          Accept: text/html,application/xhtml+xml\r\nUser-Agent: Mozilla/5.0\r\n\
          X-Lantern-Version: 2.9.9\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 302 Found\r\n"));
    assert!(response.contains(&format!("Location: {REWRITE_URL}\r\n")));
}

#[tokio::test]
async fn current_client_passes_through() {
    let backend = common::start_mock_backend("fresh").await;
    let proxy = common::start_proxy(version_config()).await;

    let request = format!(
        "GET http://{backend}/ HTTP/1.1\r\nHost: {backend}\r\nAccept: text/html\r\n\
         User-Agent: Mozilla/5.0\r\nX-Lantern-Version: 3.2.0\r\n\r\n"
    );
    let response = common::send_raw(proxy.addr, request.as_bytes()).await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("fresh"));
}

#[tokio::test]
async fn outdated_tunnel_is_hijacked() {
    let proxy = common::start_proxy(version_config()).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream
        .write_all(b"CONNECT site.example:80 HTTP/1.1\r\nHost: site.example:80\r\nX-Lantern-Version: 1.0.0\r\n\r\n")
        .await
        .unwrap();
    assert_eq!(common::read_exact(&mut stream, 19).await, b"HTTP/1.1 200 OK\r\n\r\n");

    stream
        .write_all(b"POST /form HTTP/1.1\r\nHost: site.example\r\nContent-Length: 5\r\n\r\nhello")
        .await
        .unwrap();
    let response = common::read_all(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 302 Found\r\n"));
    assert!(response.contains(&format!("Location: {REWRITE_URL}\r\n")));
    assert!(response.contains("Connection: close\r\n"));
}

#[tokio::test]
async fn tunnel_on_unchecked_port_is_left_alone() {
    let echo = common::start_echo_backend().await;
    let mut config = version_config();
    config.tunnel_ports.allowed_ports.push(echo.port());
    let proxy = common::start_proxy(config).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    let request = format!("CONNECT {echo} HTTP/1.1\r\nX-Lantern-Version: 1.0.0\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    assert_eq!(common::read_exact(&mut stream, 19).await, b"HTTP/1.1 200 OK\r\n\r\n");
    stream.write_all(b"still here").await.unwrap();
    assert_eq!(common::read_exact(&mut stream, 10).await, b"still here");
}
