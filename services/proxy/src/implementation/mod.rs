//! Proxy implementations behind redirects.
//!
//! Two kinds exist:
//! - [`EnvoyRedirect`]: embedded filtering proxy, configured over xDS. Serves
//!   every parser except DNS.
//! - [`DnsRedirect`]: DNS-aware proxy, configured with per-endpoint rules.
//!
//! The kind is chosen once when the redirect is created. Implementations keep
//! only what they need to talk to their backend; rules are passed in on each
//! call.

pub mod dns;
pub mod envoy;
pub mod mock;

use steer_revert::{FinalizeFn, RevertFn};
use thiserror::Error;

use crate::completion::WaitGroup;
use crate::policy::L7Rules;

pub use dns::{DnsIntegration, DnsProxy, DnsRedirect};
pub use envoy::{EnvoyIntegration, EnvoyRedirect, RedirectRuleKey, XdsServer};

/// Errors from proxy backends.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IntegrationError {
    /// The xDS server rejected an operation.
    #[error("xDS {operation} failed for {listener}: {reason}")]
    Xds {
        operation: &'static str,
        listener: String,
        reason: String,
    },

    /// The DNS proxy rejected a rule update.
    #[error("DNS proxy update failed for endpoint {endpoint_id}: {reason}")]
    Dns { endpoint_id: u64, reason: String },
}

/// Running proxy implementation owned by a redirect.
#[derive(Debug)]
pub enum RedirectImplementation {
    Envoy(EnvoyRedirect),
    Dns(DnsRedirect),
}

impl RedirectImplementation {
    pub fn kind(&self) -> &'static str {
        match self {
            RedirectImplementation::Envoy(_) => "envoy",
            RedirectImplementation::Dns(_) => "dns",
        }
    }

    /// Push new rules. The returned revert restores `old`.
    pub(crate) async fn update_rules(
        &self,
        old: &L7Rules,
        new: &L7Rules,
        wg: &WaitGroup,
    ) -> Result<Option<RevertFn>, IntegrationError> {
        match self {
            RedirectImplementation::Envoy(r) => r.update_rules(old, new, wg).await,
            RedirectImplementation::Dns(r) => r.update_rules(old, new).await,
        }
    }

    /// Start tearing the implementation down.
    pub(crate) async fn close(&self, wg: &WaitGroup) -> (Option<FinalizeFn>, Option<RevertFn>) {
        match self {
            RedirectImplementation::Envoy(r) => r.close(wg).await,
            RedirectImplementation::Dns(r) => r.close().await,
        }
    }
}
