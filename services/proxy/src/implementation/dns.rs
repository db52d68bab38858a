//! DNS-aware proxy redirects.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use steer_revert::{FinalizeFn, RevertError, RevertFn};
use tracing::{debug, warn};

use super::IntegrationError;
use crate::policy::{L4Proto, L7Rules};
use crate::redirect::RedirectBinding;

/// Rule surface of the DNS proxy.
///
/// Rules are keyed by endpoint and destination port/protocol.
#[async_trait]
pub trait DnsProxy: Send + Sync {
    async fn set_rules(
        &self,
        endpoint_id: u64,
        dst_port: u16,
        protocol: L4Proto,
        rules: &L7Rules,
    ) -> Result<(), IntegrationError>;

    async fn remove_rules(
        &self,
        endpoint_id: u64,
        dst_port: u16,
        protocol: L4Proto,
    ) -> Result<(), IntegrationError>;

    async fn set_log_level(&self, level: &str) -> Result<(), IntegrationError>;
}

/// Creates redirects on the DNS proxy.
#[derive(Clone)]
pub struct DnsIntegration {
    proxy: Arc<dyn DnsProxy>,
}

impl DnsIntegration {
    pub fn new(proxy: Arc<dyn DnsProxy>) -> Self {
        Self { proxy }
    }

    pub(crate) async fn create_redirect(
        &self,
        binding: &RedirectBinding,
        rules: &L7Rules,
    ) -> Result<DnsRedirect, IntegrationError> {
        self.proxy
            .set_rules(binding.endpoint_id, binding.dst_port, binding.protocol, rules)
            .await?;

        debug!(
            id = %binding.id,
            endpoint_id = binding.endpoint_id,
            dst_port = binding.dst_port,
            "Created DNS redirect"
        );

        Ok(DnsRedirect {
            endpoint_id: binding.endpoint_id,
            dst_port: binding.dst_port,
            protocol: binding.protocol,
            proxy: Arc::clone(&self.proxy),
        })
    }

    pub(crate) async fn set_log_level(&self, level: &str) -> Result<(), IntegrationError> {
        self.proxy.set_log_level(level).await
    }
}

impl fmt::Debug for DnsIntegration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsIntegration").finish_non_exhaustive()
    }
}

/// Redirect served by the DNS proxy.
pub struct DnsRedirect {
    endpoint_id: u64,
    dst_port: u16,
    protocol: L4Proto,
    proxy: Arc<dyn DnsProxy>,
}

impl DnsRedirect {
    pub(crate) async fn update_rules(
        &self,
        old: &L7Rules,
        new: &L7Rules,
    ) -> Result<Option<RevertFn>, IntegrationError> {
        self.proxy
            .set_rules(self.endpoint_id, self.dst_port, self.protocol, new)
            .await?;

        let proxy = Arc::clone(&self.proxy);
        let (endpoint_id, dst_port, protocol) = (self.endpoint_id, self.dst_port, self.protocol);
        let old = old.clone();
        Ok(Some(RevertFn::new(move || async move {
            proxy
                .set_rules(endpoint_id, dst_port, protocol, &old)
                .await
                .map_err(|e| RevertError::step("DNS rules", e))
        })))
    }

    /// Rules stay in place until the close is final.
    pub(crate) async fn close(&self) -> (Option<FinalizeFn>, Option<RevertFn>) {
        let proxy = Arc::clone(&self.proxy);
        let (endpoint_id, dst_port, protocol) = (self.endpoint_id, self.dst_port, self.protocol);
        let finalize = FinalizeFn::new(move || async move {
            if let Err(e) = proxy.remove_rules(endpoint_id, dst_port, protocol).await {
                warn!(endpoint_id, dst_port, error = %e, "Failed to remove DNS rules");
            }
        });

        (Some(finalize), None)
    }
}

impl fmt::Debug for DnsRedirect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsRedirect")
            .field("endpoint_id", &self.endpoint_id)
            .field("dst_port", &self.dst_port)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}
