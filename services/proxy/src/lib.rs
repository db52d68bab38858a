//! Steer proxy redirect coordinator.
//!
//! Steers endpoint traffic into user-space L7 proxies:
//! - Allocates and reference-counts proxy ports per listener
//! - Creates, updates and removes redirects on the filtering (Envoy) and DNS
//!   proxies
//! - Hands every change back as a transaction the caller finalizes or reverts

pub mod completion;
pub mod config;
pub mod error;
pub mod implementation;
pub mod metrics;
pub mod policy;
pub mod proxy;
pub mod redirect;
pub mod status;

pub use completion::{Completion, CompletionError, WaitGroup};
pub use error::{CreateError, ProxyError};
pub use implementation::{
    DnsIntegration, DnsProxy, EnvoyIntegration, IntegrationError, RedirectImplementation,
    RedirectRuleKey, XdsServer,
};
pub use policy::{L4Proto, L7Rules, LocalEndpoint, ParserType, ProxyPolicy};
pub use proxy::{Proxy, RedirectUpdate, REDIRECT_CREATE_ATTEMPTS};
pub use redirect::{Redirect, RedirectBinding};
pub use status::{ProxyStatus, RedirectStatus};

pub use steer_proxyports::{ProxyPorts, ProxyType};
pub use steer_revert::Transaction;
