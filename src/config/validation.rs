//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (percentages, intervals, addresses)
//! - Check that every enabled filter has what it needs
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{FilterKind, ProxyConfig};
use crate::filters::version_check::VersionRange;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("{:?} is not a socket address", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be at least 1"));
    }

    let mut seen = HashSet::new();
    for kind in &config.filters.order {
        if !seen.insert(kind) {
            errors.push(ValidationError::new("filters.order", format!("{:?} listed twice", kind)));
        }
    }

    if config.tunnel_ports.allowed_ports.contains(&0) {
        errors.push(ValidationError::new("tunnel_ports.allowed_ports", "port 0 is not valid"));
    }

    let version = &config.version_check;
    if version.enabled {
        if let Err(e) = VersionRange::parse(&version.range) {
            errors.push(ValidationError::new("version_check.range", e.to_string()));
        }
        match url::Url::parse(&version.rewrite_url) {
            Ok(url) if url.host_str().is_some() => {}
            Ok(_) => errors.push(ValidationError::new("version_check.rewrite_url", "URL has no host")),
            Err(e) => errors.push(ValidationError::new("version_check.rewrite_url", e.to_string())),
        }
        if !(0.0..=100.0).contains(&version.redirect_percentage) {
            errors.push(ValidationError::new(
                "version_check.redirect_percentage",
                format!("{} is outside 0..=100", version.redirect_percentage),
            ));
        }
        for port in &version.tunnel_ports {
            if port.parse::<u16>().is_err() {
                errors.push(ValidationError::new(
                    "version_check.tunnel_ports",
                    format!("{:?} is not a port", port),
                ));
            }
        }
        if !config.filters.order.contains(&FilterKind::VersionCheck) {
            errors.push(ValidationError::new(
                "filters.order",
                "version_check is enabled but not in the chain",
            ));
        }
    }

    if config.usage.enabled {
        if config.usage.report_interval_secs == 0 {
            errors.push(ValidationError::new("usage.report_interval_secs", "must be at least 1"));
        }
        if config.usage.queue_capacity == 0 {
            errors.push(ValidationError::new("usage.queue_capacity", "must be at least 1"));
        }
    }

    if config.timeouts.connect_secs == 0 {
        errors.push(ValidationError::new("timeouts.connect_secs", "must be at least 1"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("{:?} is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
