//! Redirect coordinator.
//!
//! [`Proxy`] owns the map of active redirects and drives every change through
//! the port allocator and the proxy implementations. Each change is applied
//! eagerly and handed back to the caller as a [`Transaction`]: finalize once
//! the caller's own change has gone through, revert if it has not.
//!
//! # Locking
//!
//! - The redirect map sits behind an async `RwLock`. Inserting and removing
//!   redirects takes the write lock; updating the rules of an existing
//!   redirect only takes the read lock plus that redirect's own mutex.
//! - The port allocator has its own lock and never calls back into the
//!   coordinator, so it is called with the map lock held.
//! - Reverts that take the map lock are only run after the caller's guard is
//!   dropped.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use steer_proxyports::{ProxyPorts, ProxyType};
use steer_revert::{FinalizeFn, RevertFn, Transaction};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::completion::WaitGroup;
use crate::error::{CreateError, ProxyError};
use crate::implementation::{
    DnsIntegration, EnvoyIntegration, IntegrationError, RedirectImplementation,
};
use crate::metrics::{RedirectCounts, RedirectMetrics};
use crate::policy::{L7Rules, LocalEndpoint, ProxyPolicy};
use crate::redirect::{Redirect, RedirectBinding};
use crate::status::{ProxyStatus, RedirectStatus};

/// Creation attempts before giving up, each on a different port.
pub const REDIRECT_CREATE_ATTEMPTS: usize = 5;

type RedirectMap = HashMap<String, Arc<Redirect>>;

/// Result of a successful create-or-update.
#[derive(Debug)]
pub struct RedirectUpdate {
    /// Port the redirect's listener is bound to.
    pub proxy_port: u16,

    /// Must be finalized or reverted by the caller.
    pub transaction: Transaction,
}

/// Redirect coordinator.
pub struct Proxy {
    redirects: Arc<RwLock<RedirectMap>>,
    ports: Arc<ProxyPorts>,
    envoy: EnvoyIntegration,
    dns: DnsIntegration,
    metrics: Arc<RedirectMetrics>,
    router_ipv4: Option<Ipv4Addr>,
}

impl Proxy {
    pub fn new(ports: Arc<ProxyPorts>, envoy: EnvoyIntegration, dns: DnsIntegration) -> Self {
        Self {
            redirects: Arc::new(RwLock::new(HashMap::new())),
            ports,
            envoy,
            dns,
            metrics: Arc::new(RedirectMetrics::new()),
            router_ipv4: None,
        }
    }

    /// Address reported in status output.
    pub fn with_router_ipv4(mut self, ip: Option<Ipv4Addr>) -> Self {
        self.router_ipv4 = ip;
        self
    }

    pub fn ports(&self) -> &Arc<ProxyPorts> {
        &self.ports
    }

    /// Create a redirect, or update the rules of an existing one.
    ///
    /// An existing redirect whose listener cannot serve the policy is removed
    /// and a new one created in its place. On error nothing is left behind.
    pub async fn create_or_update_redirect(
        &self,
        policy: &ProxyPolicy,
        id: &str,
        endpoint: &LocalEndpoint,
        wg: &WaitGroup,
    ) -> Result<RedirectUpdate, ProxyError> {
        {
            let redirects = self.redirects.read().await;
            if let Some(existing) = redirects.get(id) {
                if self.is_compatible(existing, policy).await {
                    return self.update_redirect(existing, policy, wg).await;
                }
            }
        }

        let mut redirects = self.redirects.write().await;
        let mut transaction = Transaction::new();

        // Re-check; the map may have changed while unlocked
        if let Some(existing) = redirects.get(id).cloned() {
            if self.is_compatible(&existing, policy).await {
                return self.update_redirect(&existing, policy, wg).await;
            }

            debug!(
                id,
                listener = existing.listener(),
                parser = %policy.l7_parser,
                "Replacing redirect with incompatible listener"
            );

            match self.remove_locked(&mut redirects, id, wg).await {
                Ok(removal) => transaction.merge(removal),
                Err(e) => {
                    drop(redirects);
                    return Err(ProxyError::StaleRemovalFailed(Box::new(e)));
                }
            }
        }

        match self
            .create_locked(&mut redirects, policy, id, endpoint, wg)
            .await
        {
            Ok((proxy_port, creation)) => {
                transaction.merge(creation);
                Ok(RedirectUpdate {
                    proxy_port,
                    transaction,
                })
            }
            Err(e) => {
                drop(redirects);
                if let Err(re) = transaction.revert().await {
                    warn!(id, error = %re, "Failed to revert partial redirect change");
                }
                Err(e)
            }
        }
    }

    /// Remove a redirect.
    ///
    /// Finalizing releases the proxy port; reverting puts the redirect back.
    pub async fn remove_redirect(&self, id: &str, wg: &WaitGroup) -> Result<Transaction, ProxyError> {
        let mut redirects = self.redirects.write().await;
        self.remove_locked(&mut redirects, id, wg).await
    }

    async fn is_compatible(&self, redirect: &Redirect, policy: &ProxyPolicy) -> bool {
        let binding = redirect.binding();
        let proxy_type = policy.l7_parser.proxy_type();

        if binding.ingress != policy.ingress {
            return false;
        }
        if proxy_type == ProxyType::Crd && binding.listener != policy.listener {
            return false;
        }

        self.ports.has_proxy_type(&binding.listener, proxy_type).await
    }

    async fn update_redirect(
        &self,
        redirect: &Arc<Redirect>,
        policy: &ProxyPolicy,
        wg: &WaitGroup,
    ) -> Result<RedirectUpdate, ProxyError> {
        let (proxy_port, _) = self.ports.get_proxy_port(redirect.listener()).await?;

        let mut state = redirect.state.lock().await;
        let old = state.rules.clone();
        let implementation_revert = match &state.implementation {
            Some(implementation) => implementation
                .update_rules(&old, &policy.rules, wg)
                .await
                .map_err(ProxyError::ImplementationUpdateFailed)?,
            None => None,
        };
        state.rules = policy.rules.clone();
        drop(state);

        debug!(
            id = redirect.id(),
            listener = redirect.listener(),
            proxy_port,
            "Updated existing redirect"
        );

        let mut transaction = Transaction::new();
        let target = Arc::clone(redirect);
        transaction.on_revert(RevertFn::new(move || async move {
            let result = match implementation_revert {
                Some(revert) => revert.call().await,
                None => Ok(()),
            };
            target.state.lock().await.rules = old;
            result
        }));

        Ok(RedirectUpdate {
            proxy_port,
            transaction,
        })
    }

    async fn create_implementation(
        &self,
        binding: &RedirectBinding,
        rules: &L7Rules,
        proxy_port: u16,
        wg: &WaitGroup,
    ) -> Result<RedirectImplementation, IntegrationError> {
        if binding.parser.is_dns() {
            self.dns
                .create_redirect(binding, rules)
                .await
                .map(RedirectImplementation::Dns)
        } else {
            self.envoy
                .create_redirect(binding, rules, proxy_port, wg)
                .await
                .map(RedirectImplementation::Envoy)
        }
    }

    async fn create_locked(
        &self,
        redirects: &mut RedirectMap,
        policy: &ProxyPolicy,
        id: &str,
        endpoint: &LocalEndpoint,
        wg: &WaitGroup,
    ) -> Result<(u16, Transaction), ProxyError> {
        let proxy_type = policy.l7_parser.proxy_type();
        let (listener, _) = self
            .ports
            .find_by_type(proxy_type, &policy.listener, policy.ingress)
            .await
            .ok_or_else(|| ProxyError::ListenerNotFound {
                proxy_type,
                listener: policy.listener.clone(),
                direction: policy.direction(),
            })?;

        let binding = RedirectBinding::new(id, &listener, policy, endpoint.id);

        // Prefer the port the datapath may still be redirecting to
        self.ports.restore(&listener).await;

        let mut attempts = 0;
        let mut allocated = false;
        let outcome = loop {
            attempts += 1;

            // Retries replace this creation's own allocation
            let proxy_port = match self.ports.allocate_port(&listener, allocated).await {
                Ok(port) => port,
                Err(e) => break Err(CreateError::from(e)),
            };
            allocated = true;

            match self
                .create_implementation(&binding, &policy.rules, proxy_port, wg)
                .await
            {
                Ok(implementation) => break Ok((proxy_port, implementation)),
                Err(e) if attempts < REDIRECT_CREATE_ATTEMPTS => {
                    warn!(
                        id,
                        listener = %listener,
                        proxy_port,
                        attempt = attempts,
                        error = %e,
                        "Unable to create redirect, retrying on a new port"
                    );
                }
                Err(e) => break Err(CreateError::from(e)),
            }
        };

        let (proxy_port, implementation) = match outcome {
            Ok(created) => created,
            Err(source) => {
                if allocated {
                    self.ports.reset(&listener).await;
                }
                error!(
                    id,
                    listener = %listener,
                    attempts,
                    error = %source,
                    "Failed to create redirect"
                );
                return Err(ProxyError::CreationFailed { attempts, source });
            }
        };

        let kind = implementation.kind();
        let redirect = Arc::new(Redirect::new(binding, policy.rules.clone(), implementation));
        redirects.insert(id.to_string(), Arc::clone(&redirect));
        self.metrics.update(redirects).await;

        info!(
            id,
            listener = %listener,
            proxy_port,
            parser = %policy.l7_parser,
            kind,
            "Created new redirect"
        );

        let mut transaction = Transaction::new();

        let ports = Arc::clone(&self.ports);
        let ack_listener = listener.clone();
        transaction.on_finalize(FinalizeFn::new(move || async move {
            if let Err(e) = ports.ack_proxy_port_with_reference(&ack_listener).await {
                error!(listener = %ack_listener, error = %e, "Failed to acknowledge proxy port");
            }
        }));

        let map = Arc::clone(&self.redirects);
        let ports = Arc::clone(&self.ports);
        let metrics = Arc::clone(&self.metrics);
        let id = id.to_string();
        let wg = wg.clone();
        transaction.on_revert(RevertFn::new(move || async move {
            {
                let mut redirects = map.write().await;
                if redirects
                    .get(&id)
                    .is_some_and(|current| Arc::ptr_eq(current, &redirect))
                {
                    redirects.remove(&id);
                }
                ports.reset(redirect.listener()).await;
                metrics.update(&redirects).await;
            }

            let (finalize, _) = redirect.close(&wg).await;
            if let Some(finalize) = finalize {
                finalize.call().await;
            }
            redirect.clear_implementation().await;

            debug!(id = %id, "Reverted redirect creation");
            Ok(())
        }));

        Ok((proxy_port, transaction))
    }

    async fn remove_locked(
        &self,
        redirects: &mut RedirectMap,
        id: &str,
        wg: &WaitGroup,
    ) -> Result<Transaction, ProxyError> {
        let redirect = redirects
            .remove(id)
            .ok_or_else(|| ProxyError::RedirectNotFound(id.to_string()))?;
        self.metrics.update(redirects).await;

        let (implementation_finalize, implementation_revert) = redirect.close(wg).await;

        info!(id, listener = redirect.listener(), "Removed redirect");

        let mut transaction = Transaction::new();

        let ports = Arc::clone(&self.ports);
        let removed = Arc::clone(&redirect);
        transaction.on_finalize(FinalizeFn::new(move || async move {
            if let Some(finalize) = implementation_finalize {
                finalize.call().await;
            }
            if let Err(e) = ports.release_proxy_port(removed.listener()).await {
                warn!(
                    id = removed.id(),
                    listener = removed.listener(),
                    error = %e,
                    "Failed to release proxy port"
                );
            }
            removed.clear_implementation().await;
        }));

        let map = Arc::clone(&self.redirects);
        let metrics = Arc::clone(&self.metrics);
        let id = id.to_string();
        transaction.on_revert(RevertFn::new(move || async move {
            {
                let mut redirects = map.write().await;
                redirects.insert(id, redirect);
                metrics.update(&redirects).await;
            }
            match implementation_revert {
                Some(revert) => revert.call().await,
                None => Ok(()),
            }
        }));

        Ok(transaction)
    }

    /// Active redirect by id.
    pub async fn redirect(&self, id: &str) -> Option<Arc<Redirect>> {
        self.redirects.read().await.get(id).cloned()
    }

    /// Active redirects per listener proxy type.
    pub async fn redirect_counts(&self) -> RedirectCounts {
        self.metrics.snapshot().await
    }

    /// Snapshot of the active redirects and the port pool.
    pub async fn status(&self) -> ProxyStatus {
        let redirects = self.redirects.read().await;
        let (min, max, total_ports) = self.ports.status_info().await;

        let mut list = Vec::with_capacity(redirects.len());
        for (id, redirect) in redirects.iter() {
            // Port the datapath routes to, not an in-flight allocation
            let proxy_port = self.ports.get_rules_port(redirect.listener()).await;
            list.push(RedirectStatus {
                name: id.clone(),
                proxy: redirect.listener().to_string(),
                proxy_port,
                parser: redirect.binding().parser.to_string(),
                created_at: redirect.created_at(),
            });
        }
        list.sort_by(|a, b| a.name.cmp(&b.name));

        ProxyStatus {
            ip: self
                .router_ipv4
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
            port_range: format!("{}-{}", min, max),
            total_ports,
            total_redirects: redirects.len(),
            redirects: list,
            envoy_deployment_mode: self.envoy.deployment_mode().to_string(),
        }
    }

    // ========================================================================
    // Port allocator pass-throughs
    // ========================================================================

    pub async fn ack_proxy_port(&self, name: &str) -> Result<(), ProxyError> {
        Ok(self.ports.ack_proxy_port(name).await?)
    }

    pub async fn allocate_crd_proxy_port(&self, name: &str) -> Result<u16, ProxyError> {
        Ok(self.ports.allocate_crd_proxy_port(name).await?)
    }

    pub async fn release_proxy_port(&self, name: &str) -> Result<(), ProxyError> {
        Ok(self.ports.release_proxy_port(name).await?)
    }

    pub async fn get_proxy_port(&self, name: &str) -> Result<(u16, bool), ProxyError> {
        Ok(self.ports.get_proxy_port(name).await?)
    }

    pub async fn set_proxy_port(
        &self,
        name: &str,
        proxy_type: ProxyType,
        port: u16,
        ingress: bool,
    ) -> Result<(), ProxyError> {
        Ok(self
            .ports
            .set_proxy_port(name, proxy_type, port, ingress)
            .await?)
    }

    // ========================================================================
    // Integration pass-throughs
    // ========================================================================

    /// Push an endpoint's network policy to the filtering proxy.
    pub async fn update_network_policy(
        &self,
        endpoint: &LocalEndpoint,
        policy: &serde_json::Value,
        wg: &WaitGroup,
    ) -> Result<RevertFn, ProxyError> {
        self.envoy
            .update_network_policy(endpoint, policy, wg)
            .await
            .map_err(ProxyError::PolicyUpdateFailed)
    }

    pub async fn remove_network_policy(&self, endpoint_id: u64) {
        self.envoy.remove_network_policy(endpoint_id).await;
    }

    /// Change the log level of both proxies. Failures are only logged.
    pub async fn change_log_level(&self, level: &str) {
        if let Err(e) = self.envoy.set_log_level(level).await {
            debug!(level, error = %e, "Failed to change Envoy log level");
        }
        if let Err(e) = self.dns.set_log_level(level).await {
            debug!(level, error = %e, "Failed to change DNS proxy log level");
        }
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("ports", &self.ports)
            .field("envoy", &self.envoy)
            .field("router_ipv4", &self.router_ipv4)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::implementation::mock::{MockDnsProxy, MockXdsServer};
    use crate::policy::ParserType;
    use serde_json::json;
    use std::time::Duration;
    use steer_proxyports::{NoopDatapath, HTTP_EGRESS_LISTENER};

    fn proxy() -> Proxy {
        let ports = ProxyPorts::new(10000, 10010, Arc::new(NoopDatapath)).unwrap();
        Proxy::new(
            Arc::new(ports),
            EnvoyIntegration::new(Arc::new(MockXdsServer::new())),
            DnsIntegration::new(Arc::new(MockDnsProxy::new())),
        )
    }

    fn http_policy(ingress: bool, rules: serde_json::Value) -> ProxyPolicy {
        ProxyPolicy {
            listener: String::new(),
            l7_parser: ParserType::Http,
            ingress,
            port: 80,
            protocol: Default::default(),
            rules: L7Rules::new(rules),
        }
    }

    #[tokio::test]
    async fn test_update_not_blocked_by_other_redirect() {
        let proxy = proxy();
        let wg = WaitGroup::new();
        let endpoint = LocalEndpoint::new(1);

        for (id, ingress) in [("a", false), ("b", true)] {
            proxy
                .create_or_update_redirect(&http_policy(ingress, json!([])), id, &endpoint, &wg)
                .await
                .unwrap()
                .transaction
                .finalize()
                .await;
        }

        let a = proxy.redirect("a").await.unwrap();
        let _held = a.state.lock().await;

        let update = tokio::time::timeout(
            Duration::from_secs(1),
            proxy.create_or_update_redirect(&http_policy(true, json!(["r1"])), "b", &endpoint, &wg),
        )
        .await
        .expect("update of b waited on a")
        .unwrap();
        update.transaction.finalize().await;
    }

    #[tokio::test]
    async fn test_dropped_transaction_runs_nothing() {
        let proxy = proxy();
        let update = proxy
            .create_or_update_redirect(
                &http_policy(false, json!([])),
                "a",
                &LocalEndpoint::new(1),
                &WaitGroup::new(),
            )
            .await
            .unwrap();
        drop(update.transaction);

        assert!(proxy.redirect("a").await.is_some());
        let listener = proxy.ports().listener(HTTP_EGRESS_LISTENER).await.unwrap();
        assert_eq!(listener.n_redirects, 0);
        assert!(!listener.acknowledged);
    }

    #[tokio::test]
    async fn test_counts_follow_map() {
        let proxy = proxy();
        let wg = WaitGroup::new();

        let update = proxy
            .create_or_update_redirect(&http_policy(false, json!([])), "a", &LocalEndpoint::new(1), &wg)
            .await
            .unwrap();
        assert_eq!(proxy.redirect_counts().await.get(&ProxyType::Http), Some(&1));

        update.transaction.revert().await.unwrap();
        assert!(proxy.redirect_counts().await.is_empty());
    }
}
