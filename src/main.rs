//! Policy proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client ──▶ net::listener ──▶ http::server ──▶ filters ──▶ http::upstream ──▶ Destination
//!                                       │           token
//!                                       │           tunnel_ports
//!                                       │           version_check
//!                                       │
//!                                       └── connection closed ──▶ usage::reporter ──▶ redis
//! ```

use std::path::PathBuf;

use clap::Parser;

use policy_proxy::config::{load_config, ProxyConfig};
use policy_proxy::lifecycle::{self, signals, Shutdown};
use policy_proxy::net::Listener;
use policy_proxy::observability::{logging, metrics};

#[derive(Debug, Parser)]
#[command(name = "policy-proxy", version, about = "Forward proxy with authentication, port and version policies")]
struct Cli {
    /// Path to a TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };

    logging::init(&config.observability)?;
    tracing::info!("policy-proxy v{} starting", env!("CARGO_PKG_VERSION"));

    tracing::info!(
        config_path = ?cli.config,
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        usage_enabled = config.usage.enabled,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let proxy = lifecycle::build(&config).await?;
    let listener = Listener::bind(&config.listener).await?;
    let shutdown = Shutdown::new();

    let reporter = proxy
        .reporter
        .map(|reporter| tokio::spawn(reporter.run(shutdown.subscribe())));
    let server = tokio::spawn(proxy.server.run(listener, shutdown.subscribe()));

    signals::wait_for_shutdown().await;
    shutdown.trigger();

    server.await??;
    if let Some(reporter) = reporter {
        reporter.await?;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
