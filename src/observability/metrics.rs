//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_filter_decisions_total` (counter): outcome per filter
//! - `proxy_mimic_total` (counter): token checks, labelled by whether the
//!   client was shown the apache page
//! - `proxy_version_redirects_total` (counter): redirects by method
//! - `proxy_active_connections` (gauge): current connection count
//! - `proxy_usage_samples_dropped_total` (counter): samples shed because
//!   the usage queue was full
//! - `proxy_usage_flush_errors_total` (counter): failed store writes
//! - `proxy_usage_pending_devices` (gauge): devices awaiting the next flush
//! - `proxy_usage_flush_duration_seconds` (histogram): time per flush pass

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its scrape listener.
/// Must be called from within the tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_filter_decision(filter: &'static str, decision: &'static str) {
    counter!("proxy_filter_decisions_total", "filter" => filter, "decision" => decision).increment(1);
}

pub fn record_mimic(mimicking: bool) {
    let label = if mimicking { "true" } else { "false" };
    counter!("proxy_mimic_total", "mimicking" => label).increment(1);
}

pub fn record_version_redirect(method: &str) {
    counter!("proxy_version_redirects_total", "method" => method.to_string()).increment(1);
}

pub fn record_active_connections(count: u64) {
    gauge!("proxy_active_connections").set(count as f64);
}

pub fn record_usage_sample_dropped() {
    counter!("proxy_usage_samples_dropped_total").increment(1);
}

pub fn record_usage_flush_error() {
    counter!("proxy_usage_flush_errors_total").increment(1);
}

pub fn record_usage_pending_devices(devices: usize) {
    gauge!("proxy_usage_pending_devices").set(devices as f64);
}

pub fn record_usage_flush(elapsed: Duration) {
    histogram!("proxy_usage_flush_duration_seconds").record(elapsed.as_secs_f64());
    gauge!("proxy_usage_pending_devices").set(0.0);
}
