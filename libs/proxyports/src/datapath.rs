//! Datapath integration seam.
//!
//! Acknowledging a proxy port tells the datapath to steer redirected flows to
//! it. The rule programming itself lives behind [`DatapathUpdater`].

use async_trait::async_trait;
use tracing::debug;

use crate::error::DatapathError;

/// Programs redirect rules for a proxy listener.
#[async_trait]
pub trait DatapathUpdater: Send + Sync {
    /// Install (or move) redirect rules so `ingress`/egress flows selected for
    /// listener `name` reach `proxy_port`.
    async fn install_proxy_rules(
        &self,
        proxy_port: u16,
        ingress: bool,
        name: &str,
    ) -> Result<(), DatapathError>;
}

/// Datapath that accepts every update without programming anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDatapath;

#[async_trait]
impl DatapathUpdater for NoopDatapath {
    async fn install_proxy_rules(
        &self,
        proxy_port: u16,
        ingress: bool,
        name: &str,
    ) -> Result<(), DatapathError> {
        debug!(
            listener = %name,
            proxy_port,
            ingress,
            "[NOOP] Installing proxy rules"
        );
        Ok(())
    }
}
