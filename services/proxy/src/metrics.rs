//! Redirect counts per listener proxy type.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use steer_proxyports::ProxyType;
use tokio::sync::Mutex;
use tracing::debug;

use crate::redirect::Redirect;

/// Number of active redirects keyed by the proxy type of their listener.
pub type RedirectCounts = BTreeMap<ProxyType, usize>;

/// Redirect gauges, recomputed from the redirect map on every change.
#[derive(Debug, Default)]
pub struct RedirectMetrics {
    counts: Mutex<RedirectCounts>,
}

impl RedirectMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute from the current map. Call with the map lock held.
    pub async fn update(&self, redirects: &HashMap<String, Arc<Redirect>>) {
        let mut counts = RedirectCounts::new();
        for redirect in redirects.values() {
            *counts.entry(redirect.binding().proxy_type).or_default() += 1;
        }

        debug!(total = redirects.len(), counts = ?counts, "Redirect counts updated");
        *self.counts.lock().await = counts;
    }

    pub async fn snapshot(&self) -> RedirectCounts {
        self.counts.lock().await.clone()
    }
}
