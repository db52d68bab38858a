//! Redirect entity.
//!
//! A redirect binds one endpoint's traffic to a destination port (in one
//! direction) to a proxy listener. The binding is immutable; the current
//! rules and the owned implementation handle live behind a per-redirect lock.

use chrono::{DateTime, Utc};
use steer_proxyports::ProxyType;
use steer_revert::{FinalizeFn, RevertFn};
use tokio::sync::Mutex;

use crate::completion::WaitGroup;
use crate::implementation::RedirectImplementation;
use crate::policy::{L4Proto, L7Rules, ParserType, ProxyPolicy};

/// Immutable identity of a redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectBinding {
    /// Caller-supplied redirect id.
    pub id: String,

    /// Listener the redirect is attached to.
    pub listener: String,

    pub proxy_type: ProxyType,

    pub parser: ParserType,

    pub ingress: bool,

    /// Destination L4 port.
    pub dst_port: u16,

    pub protocol: L4Proto,

    /// Owning endpoint.
    pub endpoint_id: u64,
}

impl RedirectBinding {
    pub fn new(id: &str, listener: &str, policy: &ProxyPolicy, endpoint_id: u64) -> Self {
        Self {
            id: id.to_string(),
            listener: listener.to_string(),
            proxy_type: policy.l7_parser.proxy_type(),
            parser: policy.l7_parser.clone(),
            ingress: policy.ingress,
            dst_port: policy.port,
            protocol: policy.protocol,
            endpoint_id,
        }
    }
}

#[derive(Debug)]
pub(crate) struct RedirectState {
    pub(crate) rules: L7Rules,
    pub(crate) implementation: Option<RedirectImplementation>,
}

/// An active redirect.
#[derive(Debug)]
pub struct Redirect {
    binding: RedirectBinding,
    created_at: DateTime<Utc>,
    pub(crate) state: Mutex<RedirectState>,
}

impl Redirect {
    pub(crate) fn new(
        binding: RedirectBinding,
        rules: L7Rules,
        implementation: RedirectImplementation,
    ) -> Self {
        Self {
            binding,
            created_at: Utc::now(),
            state: Mutex::new(RedirectState {
                rules,
                implementation: Some(implementation),
            }),
        }
    }

    pub fn binding(&self) -> &RedirectBinding {
        &self.binding
    }

    pub fn id(&self) -> &str {
        &self.binding.id
    }

    pub fn listener(&self) -> &str {
        &self.binding.listener
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Current rules.
    pub async fn rules(&self) -> L7Rules {
        self.state.lock().await.rules.clone()
    }

    /// The implementation has not been torn down yet.
    pub async fn has_implementation(&self) -> bool {
        self.state.lock().await.implementation.is_some()
    }

    /// Close the implementation, if any, without dropping it.
    pub(crate) async fn close(&self, wg: &WaitGroup) -> (Option<FinalizeFn>, Option<RevertFn>) {
        let state = self.state.lock().await;
        match &state.implementation {
            Some(implementation) => implementation.close(wg).await,
            None => (None, None),
        }
    }

    /// Drop the implementation handle once its teardown is final.
    pub(crate) async fn clear_implementation(&self) {
        self.state.lock().await.implementation = None;
    }
}
