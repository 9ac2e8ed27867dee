//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::usage::FlushPolicy;

/// Root configuration for the policy proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, connection limit).
    pub listener: ListenerConfig,

    /// Filter chain layout.
    pub filters: FiltersConfig,

    /// CONNECT destination port admission.
    pub tunnel_ports: TunnelPortsConfig,

    /// Shared-secret authentication.
    pub token: TokenConfig,

    /// Outdated-client redirection.
    pub version_check: VersionCheckConfig,

    /// Per-device bandwidth accounting.
    pub usage: UsageConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
        }
    }
}

/// A filter that can be placed in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    Token,
    TunnelPorts,
    VersionCheck,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FiltersConfig {
    /// Order in which filters see each request. Filters that are disabled
    /// by their own section are skipped.
    pub order: Vec<FilterKind>,
}

impl Default for FiltersConfig {
    fn default() -> Self {
        Self {
            order: vec![FilterKind::Token, FilterKind::TunnelPorts, FilterKind::VersionCheck],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TunnelPortsConfig {
    /// Ports CONNECT may reach. Empty disables the filter.
    pub allowed_ports: Vec<u16>,
}

impl Default for TunnelPortsConfig {
    fn default() -> Self {
        Self {
            allowed_ports: vec![80, 443],
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Shared secret expected in `X-Lantern-Auth-Token`. Empty disables
    /// authentication.
    pub token: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VersionCheckConfig {
    pub enabled: bool,

    /// Semver range of up-to-date clients, e.g. ">=3.0.0".
    pub range: String,

    /// Where outdated clients are sent.
    pub rewrite_url: String,

    /// CONNECT ports whose tunnels may be hijacked. Empty means ["80"].
    pub tunnel_ports: Vec<String>,

    /// Share of eligible requests to redirect, 0 to 100.
    pub redirect_percentage: f64,
}

impl Default for VersionCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            range: String::new(),
            rewrite_url: String::new(),
            tunnel_ports: vec!["80".to_string()],
            redirect_percentage: 100.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UsageConfig {
    pub enabled: bool,

    /// Redis URL, e.g. "redis://127.0.0.1:6379". Without one, counters are
    /// kept in memory only.
    pub redis_url: Option<String>,

    /// Seconds between flushes.
    pub report_interval_secs: u64,

    /// Samples buffered before new ones are dropped.
    pub queue_capacity: usize,

    /// Behaviour after a failed write within a flush.
    pub flush_policy: FlushPolicy,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redis_url: None,
            report_interval_secs: 300,
            queue_capacity: crate::usage::reporter::QUEUE_CAPACITY,
            flush_policy: FlushPolicy::default(),
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upstream connection establishment timeout in seconds.
    pub connect_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { connect_secs: 5 }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter
    /// directive.
    pub log_level: String,

    /// Emit logs as JSON lines.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
