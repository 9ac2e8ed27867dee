//! Per-device usage accounting through a running proxy.

use std::time::Duration;

mod common;

async fn wait_for_usage(tracker: &policy_proxy::usage::UsageTracker, device: &str) -> u64 {
    for _ in 0..50 {
        if let Some(usage) = tracker.get(device) {
            return usage.bytes;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("no usage reported for {device}");
}

#[tokio::test]
async fn traffic_is_attributed_to_device() {
    let backend = common::start_mock_backend("0123456789").await;
    let mut config = common::open_config();
    config.usage.enabled = true;
    let proxy = common::start_proxy(config).await;

    let request = format!("GET http://{backend}/ HTTP/1.1\r\nHost: {backend}\r\nX-Lantern-Device-Id: device-a\r\n\r\n");
    let response = common::send_raw(proxy.addr, request.as_bytes()).await;
    assert!(response.ends_with("0123456789"));

    let first = wait_for_usage(&proxy.tracker, "device-a").await;
    assert_eq!(first, (request.len() + response.len()) as u64);

    // Counters are cumulative across flushes.
    common::send_raw(proxy.addr, request.as_bytes()).await;
    let mut total = first;
    for _ in 0..50 {
        total = proxy.tracker.get("device-a").map(|u| u.bytes).unwrap_or(0);
        if total > first {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(total, first * 2);
}

#[tokio::test]
async fn anonymous_connections_are_not_counted() {
    let backend = common::start_mock_backend("ok").await;
    let mut config = common::open_config();
    config.usage.enabled = true;
    let proxy = common::start_proxy(config).await;

    let anonymous = format!("GET http://{backend}/ HTTP/1.1\r\nHost: {backend}\r\n\r\n");
    common::send_raw(proxy.addr, anonymous.as_bytes()).await;
    let known = format!("GET http://{backend}/ HTTP/1.1\r\nHost: {backend}\r\nX-Lantern-Device-Id: device-b\r\n\r\n");
    common::send_raw(proxy.addr, known.as_bytes()).await;

    wait_for_usage(&proxy.tracker, "device-b").await;
    assert_eq!(proxy.tracker.len(), 1);
}

#[tokio::test]
async fn shutdown_flushes_pending_usage() {
    let backend = common::start_mock_backend("bye").await;
    let mut config = common::open_config();
    config.usage.enabled = true;
    let mut proxy = common::start_proxy(config).await;

    let request = format!("GET http://{backend}/ HTTP/1.1\r\nHost: {backend}\r\nX-Lantern-Device-Id: device-c\r\n\r\n");
    common::send_raw(proxy.addr, request.as_bytes()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    proxy.shutdown.trigger();
    if let Some(reporter) = proxy.reporter.take() {
        reporter.await.unwrap();
    }
    assert!(proxy.tracker.get("device-c").is_some());
}
