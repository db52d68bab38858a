//! Embedded filtering proxy, configured over xDS.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use steer_proxyports::ProxyType;
use steer_revert::{FinalizeFn, RevertError, RevertFn};
use tracing::{debug, warn};

use super::IntegrationError;
use crate::completion::WaitGroup;
use crate::policy::{L4Proto, L7Rules, LocalEndpoint};
use crate::redirect::RedirectBinding;

/// Identifies the rules of one redirect on a listener.
///
/// Several redirects of one endpoint can share a listener; each keeps its own
/// rules under its destination port and protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RedirectRuleKey {
    pub endpoint_id: u64,
    pub listener: String,
    pub dst_port: u16,
    pub protocol: L4Proto,
}

impl RedirectRuleKey {
    pub fn new(endpoint_id: u64, listener: &str, dst_port: u16, protocol: L4Proto) -> Self {
        Self {
            endpoint_id,
            listener: listener.to_string(),
            dst_port,
            protocol,
        }
    }
}

impl From<&RedirectBinding> for RedirectRuleKey {
    fn from(binding: &RedirectBinding) -> Self {
        Self::new(
            binding.endpoint_id,
            &binding.listener,
            binding.dst_port,
            binding.protocol,
        )
    }
}

/// xDS control surface of the filtering proxy.
#[async_trait]
pub trait XdsServer: Send + Sync {
    /// Add (or take another reference on) a listener bound to `port`.
    async fn add_listener(
        &self,
        name: &str,
        port: u16,
        ingress: bool,
        wg: &WaitGroup,
    ) -> Result<(), IntegrationError>;

    /// Drop a reference on a listener; removed when the last one goes.
    async fn remove_listener(&self, name: &str, wg: &WaitGroup) -> Result<(), IntegrationError>;

    /// Set the rules one redirect enforces on its listener.
    async fn update_redirect_rules(
        &self,
        key: &RedirectRuleKey,
        rules: &L7Rules,
        wg: &WaitGroup,
    ) -> Result<(), IntegrationError>;

    /// Forget the rules of one redirect.
    async fn remove_redirect_rules(&self, key: &RedirectRuleKey) -> Result<(), IntegrationError>;

    /// Install an endpoint's network policy, returning the one it replaced.
    async fn update_network_policy(
        &self,
        endpoint: &LocalEndpoint,
        policy: &serde_json::Value,
        wg: &WaitGroup,
    ) -> Result<Option<serde_json::Value>, IntegrationError>;

    /// Forget an endpoint's network policy.
    async fn remove_network_policy(&self, endpoint_id: u64);

    async fn set_log_level(&self, level: &str) -> Result<(), IntegrationError>;
}

/// Creates redirects on the filtering proxy.
#[derive(Clone)]
pub struct EnvoyIntegration {
    xds: Arc<dyn XdsServer>,

    /// Proxy runs as a separate deployment rather than in-process.
    external: bool,
}

impl EnvoyIntegration {
    pub fn new(xds: Arc<dyn XdsServer>) -> Self {
        Self {
            xds,
            external: false,
        }
    }

    pub fn with_external(mut self, external: bool) -> Self {
        self.external = external;
        self
    }

    pub fn deployment_mode(&self) -> &'static str {
        if self.external {
            "external"
        } else {
            "embedded"
        }
    }

    /// Set up the listener (unless externally defined) and the redirect's rules.
    pub(crate) async fn create_redirect(
        &self,
        binding: &RedirectBinding,
        rules: &L7Rules,
        proxy_port: u16,
        wg: &WaitGroup,
    ) -> Result<EnvoyRedirect, IntegrationError> {
        // CRD listeners are managed by whoever defined them
        let owns_listener = binding.proxy_type != ProxyType::Crd;

        if owns_listener {
            self.xds
                .add_listener(&binding.listener, proxy_port, binding.ingress, wg)
                .await?;
        }

        let key = RedirectRuleKey::from(binding);
        if let Err(e) = self.xds.update_redirect_rules(&key, rules, wg).await {
            if owns_listener {
                if let Err(re) = self.xds.remove_listener(&binding.listener, wg).await {
                    warn!(listener = %binding.listener, error = %re, "Failed to remove listener");
                }
            }
            return Err(e);
        }

        debug!(
            id = %binding.id,
            listener = %binding.listener,
            proxy_port,
            "Created Envoy redirect"
        );

        Ok(EnvoyRedirect {
            key,
            proxy_port,
            ingress: binding.ingress,
            owns_listener,
            xds: Arc::clone(&self.xds),
        })
    }

    /// Install an endpoint's network policy. The revert puts back the previous
    /// policy, or removes it if there was none.
    pub(crate) async fn update_network_policy(
        &self,
        endpoint: &LocalEndpoint,
        policy: &serde_json::Value,
        wg: &WaitGroup,
    ) -> Result<RevertFn, IntegrationError> {
        let previous = self.xds.update_network_policy(endpoint, policy, wg).await?;

        let xds = Arc::clone(&self.xds);
        let endpoint = endpoint.clone();
        let wg = wg.clone();
        Ok(RevertFn::new(move || async move {
            match previous {
                Some(previous) => xds
                    .update_network_policy(&endpoint, &previous, &wg)
                    .await
                    .map(|_| ())
                    .map_err(|e| RevertError::step("network policy", e)),
                None => {
                    xds.remove_network_policy(endpoint.id).await;
                    Ok(())
                }
            }
        }))
    }

    pub(crate) async fn remove_network_policy(&self, endpoint_id: u64) {
        self.xds.remove_network_policy(endpoint_id).await;
    }

    pub(crate) async fn set_log_level(&self, level: &str) -> Result<(), IntegrationError> {
        self.xds.set_log_level(level).await
    }
}

impl fmt::Debug for EnvoyIntegration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvoyIntegration")
            .field("external", &self.external)
            .finish_non_exhaustive()
    }
}

/// Redirect served by the filtering proxy.
pub struct EnvoyRedirect {
    key: RedirectRuleKey,
    proxy_port: u16,
    ingress: bool,
    owns_listener: bool,
    xds: Arc<dyn XdsServer>,
}

impl EnvoyRedirect {
    pub fn proxy_port(&self) -> u16 {
        self.proxy_port
    }

    pub(crate) async fn update_rules(
        &self,
        old: &L7Rules,
        new: &L7Rules,
        wg: &WaitGroup,
    ) -> Result<Option<RevertFn>, IntegrationError> {
        self.xds.update_redirect_rules(&self.key, new, wg).await?;

        let xds = Arc::clone(&self.xds);
        let key = self.key.clone();
        let old = old.clone();
        let wg = wg.clone();
        Ok(Some(RevertFn::new(move || async move {
            xds.update_redirect_rules(&key, &old, &wg)
                .await
                .map_err(|e| RevertError::step("redirect rules", e))
        })))
    }

    /// Drop the listener reference now; forget the rules once final.
    pub(crate) async fn close(&self, wg: &WaitGroup) -> (Option<FinalizeFn>, Option<RevertFn>) {
        let mut revert = None;

        if self.owns_listener {
            match self.xds.remove_listener(&self.key.listener, wg).await {
                Ok(()) => {
                    let xds = Arc::clone(&self.xds);
                    let listener = self.key.listener.clone();
                    let port = self.proxy_port;
                    let ingress = self.ingress;
                    let wg = wg.clone();
                    revert = Some(RevertFn::new(move || async move {
                        xds.add_listener(&listener, port, ingress, &wg)
                            .await
                            .map_err(|e| RevertError::step("listener removal", e))
                    }));
                }
                Err(e) => {
                    warn!(listener = %self.key.listener, error = %e, "Failed to remove listener");
                }
            }
        }

        let xds = Arc::clone(&self.xds);
        let key = self.key.clone();
        let finalize = FinalizeFn::new(move || async move {
            if let Err(e) = xds.remove_redirect_rules(&key).await {
                warn!(
                    listener = %key.listener,
                    endpoint_id = key.endpoint_id,
                    dst_port = key.dst_port,
                    error = %e,
                    "Failed to remove redirect rules"
                );
            }
        });

        (Some(finalize), revert)
    }
}

impl fmt::Debug for EnvoyRedirect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvoyRedirect")
            .field("key", &self.key)
            .field("proxy_port", &self.proxy_port)
            .field("ingress", &self.ingress)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::implementation::mock::MockXdsServer;
    use crate::policy::{ParserType, ProxyPolicy};
    use serde_json::json;

    fn binding(parser: ParserType, listener: &str) -> RedirectBinding {
        let policy = ProxyPolicy {
            listener: listener.to_string(),
            l7_parser: parser,
            ingress: false,
            port: 80,
            protocol: Default::default(),
            rules: L7Rules::default(),
        };
        RedirectBinding::new("ep1:egress:80", listener, &policy, 1)
    }

    #[tokio::test]
    async fn test_create_adds_listener_and_rules() {
        let xds = Arc::new(MockXdsServer::new());
        let envoy = EnvoyIntegration::new(xds.clone());
        let wg = WaitGroup::new();
        let rules = L7Rules::new(json!([{"path": "/"}]));

        let redirect = envoy
            .create_redirect(&binding(ParserType::Http, "http-egress"), &rules, 10000, &wg)
            .await
            .unwrap();
        assert_eq!(redirect.proxy_port(), 10000);

        let listener = xds.listener("http-egress").await.unwrap();
        assert_eq!(listener.port, 10000);
        assert_eq!(listener.refs, 1);
        let key = RedirectRuleKey::new(1, "http-egress", 80, L4Proto::Tcp);
        assert_eq!(xds.rules(&key).await, Some(rules));
        assert!(wg.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_redirects_sharing_listener_keep_own_rules() {
        let xds = Arc::new(MockXdsServer::new());
        let envoy = EnvoyIntegration::new(xds.clone());
        let wg = WaitGroup::new();

        let http80 = binding(ParserType::Http, "http-egress");
        let http8080 = RedirectBinding {
            id: "ep1:egress:8080".to_string(),
            dst_port: 8080,
            ..http80.clone()
        };
        let r80 = L7Rules::new(json!(["r80"]));
        let r8080 = L7Rules::new(json!(["r8080"]));

        let first = envoy.create_redirect(&http80, &r80, 10000, &wg).await.unwrap();
        envoy
            .create_redirect(&http8080, &r8080, 10000, &wg)
            .await
            .unwrap();
        assert_eq!(xds.rules(&(&http80).into()).await, Some(r80));
        assert_eq!(xds.rules(&(&http8080).into()).await, Some(r8080.clone()));

        let (finalize, _) = first.close(&wg).await;
        finalize.unwrap().call().await;
        assert!(xds.rules(&(&http80).into()).await.is_none());
        assert_eq!(xds.rules(&(&http8080).into()).await, Some(r8080));
        assert_eq!(xds.listener("http-egress").await.unwrap().refs, 1);
    }

    #[tokio::test]
    async fn test_crd_listener_not_added() {
        let xds = Arc::new(MockXdsServer::new());
        let envoy = EnvoyIntegration::new(xds.clone());

        envoy
            .create_redirect(
                &binding(ParserType::Crd, "custom"),
                &L7Rules::default(),
                10000,
                &WaitGroup::new(),
            )
            .await
            .unwrap();
        assert!(xds.listener("custom").await.is_none());
    }

    #[tokio::test]
    async fn test_failed_rules_push_removes_listener() {
        let xds = Arc::new(MockXdsServer::new());
        xds.fail_next_rule_updates(1);
        let envoy = EnvoyIntegration::new(xds.clone());

        let result = envoy
            .create_redirect(
                &binding(ParserType::Http, "http-egress"),
                &L7Rules::default(),
                10000,
                &WaitGroup::new(),
            )
            .await;
        assert!(result.is_err());
        assert!(xds.listener("http-egress").await.is_none());
    }

    #[tokio::test]
    async fn test_close_and_revert() {
        let xds = Arc::new(MockXdsServer::new());
        let envoy = EnvoyIntegration::new(xds.clone());
        let wg = WaitGroup::new();

        let redirect = envoy
            .create_redirect(
                &binding(ParserType::Http, "http-egress"),
                &L7Rules::default(),
                10000,
                &wg,
            )
            .await
            .unwrap();

        let (finalize, revert) = redirect.close(&wg).await;
        assert!(finalize.is_some());
        assert!(xds.listener("http-egress").await.is_none());

        revert.unwrap().call().await.unwrap();
        assert_eq!(xds.listener("http-egress").await.unwrap().port, 10000);
    }

    #[tokio::test]
    async fn test_network_policy_revert() {
        let xds = Arc::new(MockXdsServer::new());
        let envoy = EnvoyIntegration::new(xds.clone());
        let endpoint = LocalEndpoint::new(7);
        let wg = WaitGroup::new();

        let revert = envoy
            .update_network_policy(&endpoint, &json!({"v": 1}), &wg)
            .await
            .unwrap();
        revert.call().await.unwrap();
        assert!(xds.network_policy(7).await.is_none());

        envoy
            .update_network_policy(&endpoint, &json!({"v": 1}), &wg)
            .await
            .unwrap();
        let revert = envoy
            .update_network_policy(&endpoint, &json!({"v": 2}), &wg)
            .await
            .unwrap();
        revert.call().await.unwrap();
        assert_eq!(xds.network_policy(7).await, Some(json!({"v": 1})));
    }
}
