//! Error types for proxy port management.

use thiserror::Error;

/// Errors returned by [`ProxyPorts`](crate::ProxyPorts).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProxyPortsError {
    /// No listener is registered under the name.
    #[error("unknown proxy listener: {0}")]
    UnknownListener(String),

    /// Every port in the range is in use or still held after a release.
    #[error("no free proxy port in range {min}-{max}")]
    PoolExhausted { min: u16, max: u16 },

    /// A static listener was used before its port was set.
    #[error("static proxy listener {0} has no port set")]
    StaticPortUnset(String),

    /// The listener has no allocated port to acknowledge.
    #[error("proxy listener {0} is not configured")]
    NotConfigured(String),

    /// Release was called more often than the port was acknowledged.
    #[error("proxy listener {0} holds no references")]
    NotReferenced(String),

    /// The listener exists with different properties.
    #[error("proxy listener {name} already registered as {existing}")]
    Conflict { name: String, existing: String },

    /// Invalid port range or port value.
    #[error("invalid proxy port: {0}")]
    InvalidPort(String),

    /// Installing datapath rules failed.
    #[error(transparent)]
    Datapath(#[from] DatapathError),
}

impl ProxyPortsError {
    /// Returns true if retrying with a different port could succeed.
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, ProxyPortsError::PoolExhausted { .. })
    }
}

/// Errors from the datapath rule backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("datapath update for {listener} on port {port} failed: {reason}")]
pub struct DatapathError {
    pub listener: String,
    pub port: u16,
    pub reason: String,
}
