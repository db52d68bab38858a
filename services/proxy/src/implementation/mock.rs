//! In-process proxy backends for testing and development.
//!
//! Both mocks keep their configuration in memory and can be told to fail the
//! next N calls of an operation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{DnsProxy, IntegrationError, RedirectRuleKey, XdsServer};
use crate::completion::WaitGroup;
use crate::policy::{L4Proto, L7Rules, LocalEndpoint};

/// Consume one injected failure, if any are left.
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Listener as seen by the mock xDS server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockListener {
    pub port: u16,
    pub ingress: bool,
    /// Redirects sharing the listener.
    pub refs: usize,
}

#[derive(Debug, Default)]
struct XdsState {
    listeners: HashMap<String, MockListener>,
    rules: HashMap<RedirectRuleKey, L7Rules>,
    policies: HashMap<u64, serde_json::Value>,
    /// Every port passed to `add_listener`, failed calls included.
    attempted_ports: Vec<u16>,
    log_level: Option<String>,
}

/// Mock xDS server.
#[derive(Debug, Default)]
pub struct MockXdsServer {
    state: Mutex<XdsState>,
    fail_adds: AtomicUsize,
    fail_rule_updates: AtomicUsize,
}

impl MockXdsServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` listener additions.
    pub fn fail_next_adds(&self, n: usize) {
        self.fail_adds.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` redirect rule updates.
    pub fn fail_next_rule_updates(&self, n: usize) {
        self.fail_rule_updates.store(n, Ordering::SeqCst);
    }

    pub async fn listener(&self, name: &str) -> Option<MockListener> {
        self.state.lock().await.listeners.get(name).cloned()
    }

    pub async fn rules(&self, key: &RedirectRuleKey) -> Option<L7Rules> {
        self.state.lock().await.rules.get(key).cloned()
    }

    pub async fn network_policy(&self, endpoint_id: u64) -> Option<serde_json::Value> {
        self.state.lock().await.policies.get(&endpoint_id).cloned()
    }

    pub async fn attempted_ports(&self) -> Vec<u16> {
        self.state.lock().await.attempted_ports.clone()
    }

    pub async fn log_level(&self) -> Option<String> {
        self.state.lock().await.log_level.clone()
    }
}

#[async_trait]
impl XdsServer for MockXdsServer {
    async fn add_listener(
        &self,
        name: &str,
        port: u16,
        ingress: bool,
        wg: &WaitGroup,
    ) -> Result<(), IntegrationError> {
        let mut state = self.state.lock().await;
        state.attempted_ports.push(port);

        if take_failure(&self.fail_adds) {
            return Err(IntegrationError::Xds {
                operation: "add listener",
                listener: name.to_string(),
                reason: "mock xDS server configured to fail".to_string(),
            });
        }

        let listener = state
            .listeners
            .entry(name.to_string())
            .or_insert(MockListener {
                port,
                ingress,
                refs: 0,
            });
        listener.refs += 1;

        info!(listener = %name, port, refs = listener.refs, "[MOCK] Adding listener");
        wg.add_completion().await.complete(Ok(()));
        Ok(())
    }

    async fn remove_listener(&self, name: &str, wg: &WaitGroup) -> Result<(), IntegrationError> {
        let mut state = self.state.lock().await;

        let Some(listener) = state.listeners.get_mut(name) else {
            return Err(IntegrationError::Xds {
                operation: "remove listener",
                listener: name.to_string(),
                reason: "no such listener".to_string(),
            });
        };

        listener.refs = listener.refs.saturating_sub(1);
        if listener.refs == 0 {
            state.listeners.remove(name);
            info!(listener = %name, "[MOCK] Removed listener");
        }

        wg.add_completion().await.complete(Ok(()));
        Ok(())
    }

    async fn update_redirect_rules(
        &self,
        key: &RedirectRuleKey,
        rules: &L7Rules,
        wg: &WaitGroup,
    ) -> Result<(), IntegrationError> {
        if take_failure(&self.fail_rule_updates) {
            return Err(IntegrationError::Xds {
                operation: "update rules",
                listener: key.listener.clone(),
                reason: "mock xDS server configured to fail".to_string(),
            });
        }

        self.state
            .lock()
            .await
            .rules
            .insert(key.clone(), rules.clone());

        debug!(
            endpoint_id = key.endpoint_id,
            listener = %key.listener,
            dst_port = key.dst_port,
            "[MOCK] Updated redirect rules"
        );
        wg.add_completion().await.complete(Ok(()));
        Ok(())
    }

    async fn remove_redirect_rules(&self, key: &RedirectRuleKey) -> Result<(), IntegrationError> {
        self.state.lock().await.rules.remove(key);
        debug!(
            endpoint_id = key.endpoint_id,
            listener = %key.listener,
            dst_port = key.dst_port,
            "[MOCK] Removed redirect rules"
        );
        Ok(())
    }

    async fn update_network_policy(
        &self,
        endpoint: &LocalEndpoint,
        policy: &serde_json::Value,
        wg: &WaitGroup,
    ) -> Result<Option<serde_json::Value>, IntegrationError> {
        let previous = self
            .state
            .lock()
            .await
            .policies
            .insert(endpoint.id, policy.clone());

        debug!(endpoint_id = endpoint.id, "[MOCK] Updated network policy");
        wg.add_completion().await.complete(Ok(()));
        Ok(previous)
    }

    async fn remove_network_policy(&self, endpoint_id: u64) {
        self.state.lock().await.policies.remove(&endpoint_id);
        debug!(endpoint_id, "[MOCK] Removed network policy");
    }

    async fn set_log_level(&self, level: &str) -> Result<(), IntegrationError> {
        self.state.lock().await.log_level = Some(level.to_string());
        Ok(())
    }
}

/// Mock DNS proxy.
#[derive(Debug, Default)]
pub struct MockDnsProxy {
    rules: Mutex<HashMap<(u64, u16, L4Proto), L7Rules>>,
    log_level: Mutex<Option<String>>,
    fail_sets: AtomicUsize,
}

impl MockDnsProxy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` rule updates.
    pub fn fail_next_sets(&self, n: usize) {
        self.fail_sets.store(n, Ordering::SeqCst);
    }

    pub async fn rules(&self, endpoint_id: u64, dst_port: u16, protocol: L4Proto) -> Option<L7Rules> {
        self.rules
            .lock()
            .await
            .get(&(endpoint_id, dst_port, protocol))
            .cloned()
    }

    pub async fn log_level(&self) -> Option<String> {
        self.log_level.lock().await.clone()
    }
}

#[async_trait]
impl DnsProxy for MockDnsProxy {
    async fn set_rules(
        &self,
        endpoint_id: u64,
        dst_port: u16,
        protocol: L4Proto,
        rules: &L7Rules,
    ) -> Result<(), IntegrationError> {
        if take_failure(&self.fail_sets) {
            return Err(IntegrationError::Dns {
                endpoint_id,
                reason: "mock DNS proxy configured to fail".to_string(),
            });
        }

        self.rules
            .lock()
            .await
            .insert((endpoint_id, dst_port, protocol), rules.clone());
        debug!(endpoint_id, dst_port, "[MOCK] Set DNS rules");
        Ok(())
    }

    async fn remove_rules(
        &self,
        endpoint_id: u64,
        dst_port: u16,
        protocol: L4Proto,
    ) -> Result<(), IntegrationError> {
        self.rules
            .lock()
            .await
            .remove(&(endpoint_id, dst_port, protocol));
        debug!(endpoint_id, dst_port, "[MOCK] Removed DNS rules");
        Ok(())
    }

    async fn set_log_level(&self, level: &str) -> Result<(), IntegrationError> {
        *self.log_level.lock().await = Some(level.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listener_refcount() {
        let xds = MockXdsServer::new();
        let wg = WaitGroup::new();

        xds.add_listener("l", 10000, false, &wg).await.unwrap();
        xds.add_listener("l", 10000, false, &wg).await.unwrap();
        assert_eq!(xds.listener("l").await.unwrap().refs, 2);

        xds.remove_listener("l", &wg).await.unwrap();
        assert_eq!(xds.listener("l").await.unwrap().refs, 1);
        xds.remove_listener("l", &wg).await.unwrap();
        assert!(xds.listener("l").await.is_none());

        assert!(xds.remove_listener("l", &wg).await.is_err());
        assert!(wg.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let xds = MockXdsServer::new();
        let wg = WaitGroup::new();
        xds.fail_next_adds(2);

        assert!(xds.add_listener("l", 10000, false, &wg).await.is_err());
        assert!(xds.add_listener("l", 10001, false, &wg).await.is_err());
        assert!(xds.add_listener("l", 10002, false, &wg).await.is_ok());
        assert_eq!(xds.attempted_ports().await, vec![10000, 10001, 10002]);
        assert_eq!(xds.listener("l").await.unwrap().port, 10002);
    }

    #[tokio::test]
    async fn test_dns_failures() {
        let dns = MockDnsProxy::new();
        dns.fail_next_sets(1);

        let rules = L7Rules::default();
        assert!(dns.set_rules(1, 53, L4Proto::Udp, &rules).await.is_err());
        assert!(dns.set_rules(1, 53, L4Proto::Udp, &rules).await.is_ok());
        assert_eq!(dns.rules(1, 53, L4Proto::Udp).await, Some(rules));
    }
}
