//! Policy inputs for redirects.
//!
//! A redirect is requested with a [`ProxyPolicy`]: which listener and L7
//! parser should handle traffic to a destination port, in which direction,
//! and the opaque L7 rules the proxy enforces.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};
use steer_proxyports::ProxyType;

/// L7 parser requested by policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ParserType {
    Http,
    Kafka,
    Dns,
    /// Listener defined outside the agent, referenced by name.
    Crd,
    /// Any other parser; handled by the embedded filtering proxy.
    Other(String),
}

impl ParserType {
    pub fn as_str(&self) -> &str {
        match self {
            ParserType::Http => "http",
            ParserType::Kafka => "kafka",
            ParserType::Dns => "dns",
            ParserType::Crd => "crd",
            ParserType::Other(name) => name,
        }
    }

    /// Listener type serving this parser.
    pub fn proxy_type(&self) -> ProxyType {
        match self {
            ParserType::Dns => ProxyType::Dns,
            ParserType::Crd => ProxyType::Crd,
            _ => ProxyType::Http,
        }
    }

    pub fn is_dns(&self) -> bool {
        matches!(self, ParserType::Dns)
    }
}

impl From<String> for ParserType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "http" => ParserType::Http,
            "kafka" => ParserType::Kafka,
            "dns" => ParserType::Dns,
            "crd" => ParserType::Crd,
            _ => ParserType::Other(s),
        }
    }
}

impl From<&str> for ParserType {
    fn from(s: &str) -> Self {
        ParserType::from(s.to_string())
    }
}

impl From<ParserType> for String {
    fn from(p: ParserType) -> Self {
        p.as_str().to_string()
    }
}

impl fmt::Display for ParserType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// L4 protocol of the redirected destination port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum L4Proto {
    #[default]
    Tcp,
    Udp,
    Any,
}

/// Opaque L7 rules handed to the proxy unchanged.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct L7Rules(pub serde_json::Value);

impl L7Rules {
    pub fn new(rules: serde_json::Value) -> Self {
        Self(rules)
    }

    /// No rules (null, empty array or empty object).
    pub fn is_empty(&self) -> bool {
        match &self.0 {
            serde_json::Value::Null => true,
            serde_json::Value::Array(a) => a.is_empty(),
            serde_json::Value::Object(o) => o.is_empty(),
            _ => false,
        }
    }
}

/// Listener selection and rules for one redirect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyPolicy {
    /// Listener name; only meaningful for CRD parsers.
    #[serde(default)]
    pub listener: String,

    pub l7_parser: ParserType,

    pub ingress: bool,

    /// Destination L4 port.
    pub port: u16,

    #[serde(default)]
    pub protocol: L4Proto,

    #[serde(default)]
    pub rules: L7Rules,
}

impl ProxyPolicy {
    pub fn direction(&self) -> &'static str {
        if self.ingress {
            "ingress"
        } else {
            "egress"
        }
    }
}

/// Endpoint that owns redirects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalEndpoint {
    pub id: u64,

    #[serde(default)]
    pub ipv4: Option<Ipv4Addr>,

    #[serde(default)]
    pub ipv6: Option<Ipv6Addr>,
}

impl LocalEndpoint {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ipv4: None,
            ipv6: None,
        }
    }
}
