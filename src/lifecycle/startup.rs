//! Startup orchestration.
//!
//! # Responsibilities
//! - Build the filter chain in configured order
//! - Build the upstream: raw TCP for tunnels, forwarded requests decorated
//!   by the version checker
//! - Connect the usage store and create the reporter
//! - Assemble the server
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - Listeners are bound by the caller, so tests can use ephemeral ports

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::{FilterKind, ProxyConfig, UsageConfig};
use crate::filters::version_check::VersionCheckError;
use crate::filters::{FilterChain, TokenFilter, TunnelPortsFilter, VersionChecker};
use crate::http::{DirectUpstream, ProxyServer};
use crate::net::dial::{Dialer, TcpDialer};
use crate::usage::{MemoryStore, RedisStore, StoreError, UsageHandle, UsageReporter, UsageStore, UsageTracker};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("version check: {0}")]
    VersionCheck(#[from] VersionCheckError),
    #[error("usage store: {0}")]
    Store(#[from] StoreError),
}

/// Everything needed to serve traffic, not yet running.
pub struct Proxy {
    pub server: ProxyServer,
    /// Present when usage accounting is enabled; spawn its `run`.
    pub reporter: Option<UsageReporter>,
    pub tracker: UsageTracker,
}

pub async fn build(config: &ProxyConfig) -> Result<Proxy, StartupError> {
    let version_checker = build_version_checker(config)?;
    let chain = build_filter_chain(config, version_checker.clone());
    let upstream = build_upstream(config, version_checker.as_deref())?;

    let tracker = UsageTracker::new();
    let mut server = ProxyServer::new(chain, Arc::new(upstream));
    let reporter = match build_usage(&config.usage, tracker.clone()).await? {
        Some((handle, reporter)) => {
            server = server.with_usage(handle);
            Some(reporter)
        }
        None => None,
    };

    Ok(Proxy {
        server,
        reporter,
        tracker,
    })
}

pub fn build_version_checker(config: &ProxyConfig) -> Result<Option<Arc<VersionChecker>>, VersionCheckError> {
    let settings = &config.version_check;
    if !settings.enabled {
        return Ok(None);
    }
    let checker = VersionChecker::new(
        &settings.range,
        &settings.rewrite_url,
        settings.tunnel_ports.clone(),
        settings.redirect_percentage,
    )?;
    tracing::info!(
        range = %settings.range,
        rewrite_url = %checker.rewrite_url(),
        ppm = checker.ppm(),
        "Version check enabled"
    );
    Ok(Some(Arc::new(checker)))
}

/// Filters in configured order. Filters disabled by their own settings are
/// left out.
pub fn build_filter_chain(config: &ProxyConfig, version_checker: Option<Arc<VersionChecker>>) -> FilterChain {
    let mut chain = FilterChain::new();
    for kind in &config.filters.order {
        match kind {
            FilterKind::Token => {
                if config.token.token.is_empty() {
                    tracing::warn!("No auth token configured, accepting unauthenticated clients");
                }
                chain.push(Arc::new(TokenFilter::new(config.token.token.clone())));
            }
            FilterKind::TunnelPorts => {
                if config.tunnel_ports.allowed_ports.is_empty() {
                    continue;
                }
                chain.push(Arc::new(TunnelPortsFilter::new(
                    config.tunnel_ports.allowed_ports.iter().copied(),
                )));
            }
            FilterKind::VersionCheck => {
                if let Some(checker) = &version_checker {
                    chain.push(checker.clone());
                }
            }
        }
    }
    chain
}

/// CONNECT tunnels always get plain TCP; only forwarded requests to the
/// rewrite destination may be upgraded to TLS.
pub fn build_upstream(
    config: &ProxyConfig,
    version_checker: Option<&VersionChecker>,
) -> Result<DirectUpstream, VersionCheckError> {
    let tcp: Arc<dyn Dialer> = Arc::new(TcpDialer::new(Duration::from_secs(config.timeouts.connect_secs)));
    let upstream = DirectUpstream::new(Arc::clone(&tcp));
    Ok(match version_checker {
        Some(checker) => upstream.with_forward_dialer(checker.dialer(tcp)?),
        None => upstream,
    })
}

pub async fn build_usage(
    config: &UsageConfig,
    tracker: UsageTracker,
) -> Result<Option<(UsageHandle, UsageReporter)>, StoreError> {
    if !config.enabled {
        return Ok(None);
    }
    let store: Arc<dyn UsageStore> = match &config.redis_url {
        Some(url) => Arc::new(RedisStore::connect(url).await?),
        None => {
            tracing::warn!("No redis URL configured, usage counters are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };
    Ok(Some(UsageReporter::new(store, tracker, config)))
}
