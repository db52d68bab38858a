//! Proxy service configuration.

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Proxy service configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Lowest proxy port handed out.
    pub port_min: u16,

    /// Highest proxy port handed out (inclusive).
    pub port_max: u16,

    /// How long a released port is held back from other listeners.
    pub port_reuse_delay: Duration,

    /// Port the DNS proxy binds itself, if enabled.
    pub dns_proxy_port: Option<u16>,

    /// Router address reported in status output.
    pub router_ipv4: Option<Ipv4Addr>,

    /// Filtering proxy runs as a separate deployment.
    pub external_envoy: bool,

    /// Interval between status log lines.
    pub status_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port_min: u16 = get("STEER_PROXY_PORT_MIN")
            .map(|v| v.parse())
            .transpose()
            .context("STEER_PROXY_PORT_MIN must be a port number.")?
            .unwrap_or(10000);

        let port_max: u16 = get("STEER_PROXY_PORT_MAX")
            .map(|v| v.parse())
            .transpose()
            .context("STEER_PROXY_PORT_MAX must be a port number.")?
            .unwrap_or(20000);

        if port_min == 0 || port_min > port_max {
            bail!(
                "Invalid proxy port range {}-{}. STEER_PROXY_PORT_MIN must be non-zero and not above STEER_PROXY_PORT_MAX.",
                port_min,
                port_max
            );
        }

        let reuse_delay_ms: u64 = get("STEER_PORT_REUSE_DELAY_MS")
            .map(|v| v.parse())
            .transpose()
            .context("STEER_PORT_REUSE_DELAY_MS must be an integer (milliseconds).")?
            .unwrap_or(300_000);

        let dns_proxy_port: Option<u16> = get("STEER_DNS_PROXY_PORT")
            .map(|v| v.parse())
            .transpose()
            .context("STEER_DNS_PROXY_PORT must be a port number.")?
            .filter(|port| *port != 0);

        let router_ipv4: Option<Ipv4Addr> = get("STEER_ROUTER_IPV4")
            .map(|v| v.parse())
            .transpose()
            .context("STEER_ROUTER_IPV4 must be an IPv4 address.")?;

        let external_envoy = get("STEER_EXTERNAL_ENVOY")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let status_interval_secs: u64 = get("STEER_STATUS_INTERVAL_SECS")
            .map(|v| v.parse())
            .transpose()
            .context("STEER_STATUS_INTERVAL_SECS must be an integer (seconds).")?
            .unwrap_or(30);

        let log_level = get("STEER_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            port_min,
            port_max,
            port_reuse_delay: Duration::from_millis(reuse_delay_ms),
            dns_proxy_port,
            router_ipv4,
            external_envoy,
            status_interval: Duration::from_secs(status_interval_secs.max(1)),
            log_level,
        })
    }
}
