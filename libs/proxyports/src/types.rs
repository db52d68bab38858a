//! Listener descriptors.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of proxy a listener port belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProxyType {
    /// Embedded filtering proxy; also hosts every non-DNS L7 parser.
    #[serde(rename = "http")]
    Http,
    /// DNS-aware proxy.
    #[serde(rename = "DNS")]
    Dns,
    /// Externally defined listener, looked up by name.
    #[serde(rename = "CRD")]
    Crd,
}

impl ProxyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyType::Http => "http",
            ProxyType::Dns => "DNS",
            ProxyType::Crd => "CRD",
        }
    }
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a named proxy listener.
///
/// The live descriptor is owned by [`ProxyPorts`](crate::ProxyPorts); callers
/// only ever see copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyPort {
    /// Proxy kind served on this port.
    pub proxy_type: ProxyType,

    /// Ingress (true) or egress (false) listener.
    pub ingress: bool,

    /// Port currently allocated for the listener, 0 if none.
    pub proxy_port: u16,

    /// Port the datapath was last told to redirect to, 0 if never.
    pub rules_port: u16,

    /// Port is chosen by the proxy itself and never returned to the pool.
    pub is_static: bool,

    /// A port has been allocated and not yet reset or released.
    pub configured: bool,

    /// The datapath has confirmed rules for `proxy_port`.
    pub acknowledged: bool,

    /// Number of redirects holding a reference on the port.
    pub n_redirects: u32,

    /// Allocations handed out and not yet acknowledged or reset.
    pub n_pending: u32,

    /// Listener only accepts traffic from the local host.
    pub local_only: bool,
}

impl ProxyPort {
    pub(crate) fn new(proxy_type: ProxyType, ingress: bool, local_only: bool) -> Self {
        Self {
            proxy_type,
            ingress,
            proxy_port: 0,
            rules_port: 0,
            is_static: false,
            configured: false,
            acknowledged: false,
            n_redirects: 0,
            n_pending: 0,
            local_only,
        }
    }

    pub(crate) fn new_static(proxy_type: ProxyType, ingress: bool, local_only: bool) -> Self {
        Self {
            is_static: true,
            ..Self::new(proxy_type, ingress, local_only)
        }
    }

    /// Traffic direction as a log-friendly string.
    pub fn direction(&self) -> &'static str {
        if self.ingress {
            "ingress"
        } else {
            "egress"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_type_display() {
        assert_eq!(ProxyType::Http.to_string(), "http");
        assert_eq!(ProxyType::Dns.to_string(), "DNS");
        assert_eq!(ProxyType::Crd.to_string(), "CRD");
    }

    #[test]
    fn test_proxy_type_serde_names() {
        let json = serde_json::to_string(&ProxyType::Dns).unwrap();
        assert_eq!(json, "\"DNS\"");
        let parsed: ProxyType = serde_json::from_str("\"http\"").unwrap();
        assert_eq!(parsed, ProxyType::Http);
    }

    #[test]
    fn test_static_descriptor() {
        let pp = ProxyPort::new_static(ProxyType::Dns, false, true);
        assert!(pp.is_static);
        assert_eq!(pp.direction(), "egress");
        assert_eq!(pp.n_redirects, 0);
        assert_eq!(pp.n_pending, 0);
    }
}
