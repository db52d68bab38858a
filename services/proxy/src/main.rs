//! Steer proxy service
//!
//! Runs the redirect coordinator on a host.
//!
//! ## Architecture
//!
//! - **Port pool**: proxy ports per listener, acknowledged against the datapath
//! - **Coordinator**: redirect map and finalize/revert transactions
//! - **Backends**: Envoy over xDS and the DNS proxy (mock in dev)

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use steer_proxy::config::Config;
use steer_proxy::implementation::mock::{MockDnsProxy, MockXdsServer};
use steer_proxy::{DnsIntegration, EnvoyIntegration, Proxy, ProxyPorts, ProxyType};
use steer_proxyports::{NoopDatapath, DNS_EGRESS_LISTENER};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to STEER_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting steer proxy");
    info!(
        port_min = config.port_min,
        port_max = config.port_max,
        port_reuse_delay_ms = config.port_reuse_delay.as_millis() as u64,
        dns_proxy_port = ?config.dns_proxy_port,
        external_envoy = config.external_envoy,
        "Configuration loaded"
    );

    // Datapath and proxy backends (mock for now)
    let ports = ProxyPorts::new(config.port_min, config.port_max, Arc::new(NoopDatapath))
        .context("Failed to create proxy port pool")?
        .with_reuse_delay(config.port_reuse_delay);
    let ports = Arc::new(ports);

    if let Some(port) = config.dns_proxy_port {
        ports
            .set_proxy_port(DNS_EGRESS_LISTENER, ProxyType::Dns, port, false)
            .await
            .context("Failed to set DNS proxy port")?;
    }

    let envoy = EnvoyIntegration::new(Arc::new(MockXdsServer::new()))
        .with_external(config.external_envoy);
    let dns = DnsIntegration::new(Arc::new(MockDnsProxy::new()));

    let proxy = Arc::new(Proxy::new(ports, envoy, dns).with_router_ipv4(config.router_ipv4));
    proxy.change_log_level(&config.log_level).await;

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    // Periodic status report
    let status_handle = tokio::spawn({
        let proxy = Arc::clone(&proxy);
        let interval = config.status_interval;
        async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let status = proxy.status().await;
                        match serde_json::to_string(&status) {
                            Ok(json) => info!(
                                total_redirects = status.total_redirects,
                                total_ports = status.total_ports,
                                status = %json,
                                "Proxy status"
                            ),
                            Err(e) => error!(error = %e, "Failed to serialize proxy status"),
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);
    if let Err(e) = status_handle.await {
        error!(error = %e, "Status task panicked");
    }

    info!("Steer proxy shutdown complete");
    Ok(())
}
