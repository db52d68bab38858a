//! Proxy status snapshot.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One active redirect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedirectStatus {
    /// Redirect id.
    pub name: String,

    /// Listener the redirect is attached to.
    pub proxy: String,

    pub proxy_port: u16,

    pub parser: String,

    pub created_at: DateTime<Utc>,
}

/// Point-in-time view of the coordinator and its port pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyStatus {
    /// Router IPv4 address, empty if unknown.
    pub ip: String,

    /// Configured port range, `min-max`.
    pub port_range: String,

    /// Ports reserved or in use.
    pub total_ports: usize,

    pub total_redirects: usize,

    /// Sorted by name.
    pub redirects: Vec<RedirectStatus>,

    /// `embedded` or `external`.
    pub envoy_deployment_mode: String,
}
