//! Redirect coordinator errors.

use steer_proxyports::{ProxyPortsError, ProxyType};
use thiserror::Error;

use crate::implementation::IntegrationError;

/// Why a single creation attempt failed.
#[derive(Debug, Error)]
pub enum CreateError {
    #[error(transparent)]
    Port(#[from] ProxyPortsError),

    #[error(transparent)]
    Integration(#[from] IntegrationError),
}

/// Errors returned by [`Proxy`](crate::Proxy).
#[derive(Debug, Error)]
pub enum ProxyError {
    /// No listener serves the requested type and direction.
    #[error("no {proxy_type} {direction} proxy listener found (listener: {listener:?})")]
    ListenerNotFound {
        proxy_type: ProxyType,
        listener: String,
        direction: &'static str,
    },

    /// Pushing new rules to an existing redirect failed.
    #[error("unable to update redirect rules")]
    ImplementationUpdateFailed(#[source] IntegrationError),

    /// An incompatible redirect could not be removed before replacing it.
    #[error("unable to remove old redirect")]
    StaleRemovalFailed(#[source] Box<ProxyError>),

    /// Every creation attempt failed.
    #[error("failed to create redirect after {attempts} attempts")]
    CreationFailed {
        attempts: usize,
        #[source]
        source: CreateError,
    },

    #[error("redirect not found: {0}")]
    RedirectNotFound(String),

    /// Network policy could not be pushed to the filtering proxy.
    #[error("unable to update network policy")]
    PolicyUpdateFailed(#[source] IntegrationError),

    #[error(transparent)]
    PortAllocation(#[from] ProxyPortsError),
}
