//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use policy_proxy::config::ProxyConfig;
use policy_proxy::lifecycle::{self, Shutdown};
use policy_proxy::net::Listener;
use policy_proxy::usage::UsageTracker;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// A proxy running on an ephemeral port.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub tracker: UsageTracker,
    pub reporter: Option<tokio::task::JoinHandle<()>>,
}

/// Boot the proxy from `config`, ignoring its bind address. The usage
/// reporter starts immediately and flushes every 100ms.
pub async fn start_proxy(config: ProxyConfig) -> TestProxy {
    let proxy = lifecycle::build(&config).await.unwrap();
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap();
    let listener = Listener::from_tcp(tcp, config.listener.max_connections);
    let shutdown = Shutdown::new();

    let reporter = proxy.reporter.map(|reporter| {
        let reporter = reporter
            .with_startup_jitter(Duration::ZERO)
            .with_interval(Duration::from_millis(100));
        tokio::spawn(reporter.run(shutdown.subscribe()))
    });
    let server_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = proxy.server.run(listener, server_shutdown).await;
    });

    TestProxy {
        addr,
        shutdown,
        tracker: proxy.tracker,
        reporter,
    }
}

/// Config with every filter disabled, so tests enable only what they need.
pub fn open_config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.tunnel_ports.allowed_ports.clear();
    config.usage.enabled = false;
    config
}

/// Start a mock origin that reads one request head and answers with a
/// fixed body.
pub async fn start_mock_backend(response: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((socket, _)) => {
                    tokio::spawn(async move {
                        let mut socket = BufReader::new(socket);
                        let mut line = String::new();
                        loop {
                            line.clear();
                            match socket.read_line(&mut line).await {
                                Ok(0) | Err(_) => return,
                                Ok(_) if line == "\r\n" => break,
                                Ok(_) => {}
                            }
                        }
                        let response_str = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            response.len(),
                            response
                        );
                        let _ = socket.write_all(response_str.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

/// Start a TCP echo server, the far end of CONNECT tunnels.
pub async fn start_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

/// Send `request` and read until the proxy closes the connection.
pub async fn send_raw(addr: SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    read_all(&mut stream).await
}

pub async fn read_all(stream: &mut TcpStream) -> String {
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
        .await
        .expect("proxy did not close the connection")
        .unwrap();
    String::from_utf8_lossy(&out).into_owned()
}

/// Read exactly `n` bytes.
pub async fn read_exact(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("timed out waiting for proxy")
        .unwrap();
    buf
}
