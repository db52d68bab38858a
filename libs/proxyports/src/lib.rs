//! Proxy port management.
//!
//! Every proxy listener (HTTP ingress/egress, DNS egress, externally defined
//! CRD listeners) is identified by name and owns at most one port from a
//! configured range. This library:
//!
//! - Allocates ports for listeners, preferring the port the datapath already
//!   redirects to.
//! - Tracks a reference count per listener. The count only grows when the
//!   datapath has acknowledged the port.
//! - Holds released ports for a reuse delay so a different listener cannot
//!   pick them up while old flows may still be steered to them.
//!
//! # Invariants
//!
//! - A port is owned by at most one listener at a time.
//! - `n_redirects` is incremented only by
//!   [`ProxyPorts::ack_proxy_port_with_reference`].
//! - A reset only undoes the listener's allocation once no other allocation
//!   on it is still waiting for an acknowledgement.
//! - Static ports are never returned to the pool.

mod datapath;
mod error;
mod types;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub use datapath::{DatapathUpdater, NoopDatapath};
pub use error::{DatapathError, ProxyPortsError};
pub use types::{ProxyPort, ProxyType};

/// Default time a released port is held before another listener may take it.
pub const DEFAULT_PORT_REUSE_DELAY: Duration = Duration::from_secs(5 * 60);

/// Built-in egress listener of the embedded filtering proxy.
pub const HTTP_EGRESS_LISTENER: &str = "steer-http-egress";

/// Built-in ingress listener of the embedded filtering proxy.
pub const HTTP_INGRESS_LISTENER: &str = "steer-http-ingress";

/// Built-in egress listener of the DNS proxy (static port).
pub const DNS_EGRESS_LISTENER: &str = "steer-dns-egress";

/// Ownership state of a single port number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortState {
    /// Allocated but not yet acknowledged by the datapath.
    Reserved,
    /// Acknowledged; the datapath redirects to it.
    InUse,
    /// Given up at the recorded time; only the owner may reclaim it before
    /// the reuse delay expires.
    Released(Instant),
}

#[derive(Debug, Clone)]
struct PortEntry {
    owner: String,
    state: PortState,
}

#[derive(Debug)]
struct PortsState {
    /// Listeners by name. Ordered so lookups by type are deterministic.
    listeners: BTreeMap<String, ProxyPort>,

    /// Port number ownership.
    ports: HashMap<u16, PortEntry>,

    /// Next port to try for a fresh allocation.
    cursor: u16,
}

impl PortsState {
    fn listener(&self, name: &str) -> Result<ProxyPort, ProxyPortsError> {
        self.listeners
            .get(name)
            .cloned()
            .ok_or_else(|| ProxyPortsError::UnknownListener(name.to_string()))
    }

    fn listener_mut(&mut self, name: &str) -> Result<&mut ProxyPort, ProxyPortsError> {
        self.listeners
            .get_mut(name)
            .ok_or_else(|| ProxyPortsError::UnknownListener(name.to_string()))
    }

    /// Port may be taken by `name` right now.
    fn usable_by(&self, port: u16, name: &str, delay: Duration) -> bool {
        match self.ports.get(&port) {
            None => true,
            Some(entry) if entry.owner == name => true,
            Some(entry) => matches!(entry.state, PortState::Released(at) if at.elapsed() >= delay),
        }
    }

    /// Port may be handed to a listener that never owned it.
    fn free_for_new_owner(&self, port: u16, delay: Duration) -> bool {
        match self.ports.get(&port) {
            None => true,
            Some(entry) => matches!(entry.state, PortState::Released(at) if at.elapsed() >= delay),
        }
    }

    /// Reserve `port` for `name` unless it is already in use by it.
    fn reserve(&mut self, port: u16, name: &str) {
        if let Some(entry) = self.ports.get(&port) {
            if entry.owner == name && entry.state == PortState::InUse {
                return;
            }
        }
        self.ports.insert(
            port,
            PortEntry {
                owner: name.to_string(),
                state: PortState::Reserved,
            },
        );
    }

    /// Give up an unacknowledged reservation held by `name`.
    fn drop_reservation(&mut self, port: u16, name: &str) {
        if let Some(entry) = self.ports.get_mut(&port) {
            if entry.owner == name && entry.state == PortState::Reserved {
                entry.state = PortState::Released(Instant::now());
            }
        }
    }

    /// Give up any hold `name` has on `port`.
    fn retire(&mut self, port: u16, name: &str) {
        if let Some(entry) = self.ports.get_mut(&port) {
            if entry.owner == name && !matches!(entry.state, PortState::Released(_)) {
                entry.state = PortState::Released(Instant::now());
            }
        }
    }

    fn next_free(&mut self, exclude: u16, min: u16, max: u16, delay: Duration) -> Option<u16> {
        let span = u32::from(max - min) + 1;
        for _ in 0..span {
            let candidate = self.cursor;
            self.cursor = if self.cursor >= max { min } else { self.cursor + 1 };
            if candidate != exclude && self.free_for_new_owner(candidate, delay) {
                return Some(candidate);
            }
        }
        None
    }

    fn ports_in_use(&self) -> usize {
        self.ports
            .values()
            .filter(|e| !matches!(e.state, PortState::Released(_)))
            .count()
    }
}

/// Proxy port allocator shared by all redirects on a host.
pub struct ProxyPorts {
    /// Lowest port handed out.
    range_min: u16,

    /// Highest port handed out (inclusive).
    range_max: u16,

    /// How long a released port is held back from other listeners.
    reuse_delay: Duration,

    /// Datapath rule backend.
    datapath: Arc<dyn DatapathUpdater>,

    state: Mutex<PortsState>,
}

impl ProxyPorts {
    /// Create an allocator for `[min, max]` with the built-in listeners
    /// registered.
    pub fn new(
        min: u16,
        max: u16,
        datapath: Arc<dyn DatapathUpdater>,
    ) -> Result<Self, ProxyPortsError> {
        if min == 0 || min > max {
            return Err(ProxyPortsError::InvalidPort(format!(
                "range {}-{} is empty or starts at 0",
                min, max
            )));
        }

        let mut listeners = BTreeMap::new();
        listeners.insert(
            HTTP_EGRESS_LISTENER.to_string(),
            ProxyPort::new(ProxyType::Http, false, true),
        );
        listeners.insert(
            HTTP_INGRESS_LISTENER.to_string(),
            ProxyPort::new(ProxyType::Http, true, true),
        );
        listeners.insert(
            DNS_EGRESS_LISTENER.to_string(),
            ProxyPort::new_static(ProxyType::Dns, false, true),
        );

        Ok(Self {
            range_min: min,
            range_max: max,
            reuse_delay: DEFAULT_PORT_REUSE_DELAY,
            datapath,
            state: Mutex::new(PortsState {
                listeners,
                ports: HashMap::new(),
                cursor: min,
            }),
        })
    }

    /// Set how long released ports are held back.
    pub fn with_reuse_delay(mut self, delay: Duration) -> Self {
        self.reuse_delay = delay;
        self
    }

    /// Find the listener serving `proxy_type` in the given direction.
    ///
    /// CRD listeners are looked up by `listener` name (always egress). For
    /// other types a listener named `listener` is preferred if it matches,
    /// otherwise the first listener of that type and direction is returned.
    pub async fn find_by_type(
        &self,
        proxy_type: ProxyType,
        listener: &str,
        ingress: bool,
    ) -> Option<(String, ProxyPort)> {
        let state = self.state.lock().await;

        if proxy_type == ProxyType::Crd {
            return state
                .listeners
                .get(listener)
                .filter(|pp| pp.proxy_type == ProxyType::Crd && !pp.ingress)
                .map(|pp| (listener.to_string(), pp.clone()));
        }

        let serves = |pp: &ProxyPort| pp.proxy_type == proxy_type && pp.ingress == ingress;

        if !listener.is_empty() {
            if let Some(pp) = state.listeners.get(listener).filter(|pp| serves(pp)) {
                return Some((listener.to_string(), pp.clone()));
            }
        }

        state
            .listeners
            .iter()
            .find(|(_, pp)| serves(pp))
            .map(|(name, pp)| (name.clone(), pp.clone()))
    }

    /// Listener is configured and serves `proxy_type`.
    pub async fn has_proxy_type(&self, name: &str, proxy_type: ProxyType) -> bool {
        let state = self.state.lock().await;
        state
            .listeners
            .get(name)
            .map(|pp| pp.configured && pp.proxy_type == proxy_type)
            .unwrap_or(false)
    }

    /// Snapshot of a listener.
    pub async fn listener(&self, name: &str) -> Option<ProxyPort> {
        self.state.lock().await.listeners.get(name).cloned()
    }

    /// Try the port the datapath last redirected to before allocating a new one.
    pub async fn restore(&self, name: &str) {
        let mut state = self.state.lock().await;
        if let Some(pp) = state.listeners.get_mut(name) {
            if pp.proxy_port == 0 {
                pp.proxy_port = pp.rules_port;
            }
        }
    }

    /// Assign a port to the listener.
    ///
    /// Keeps the current (or restored) port when possible. With
    /// `force_fresh`, a port different from the current one is chosen; the
    /// previous unacknowledged reservation is given up.
    ///
    /// Every successful call must be followed by one acknowledgement or one
    /// [`reset`](Self::reset). A forced reallocation replaces the caller's
    /// earlier allocation and does not count as a new one.
    pub async fn allocate_port(&self, name: &str, force_fresh: bool) -> Result<u16, ProxyPortsError> {
        let mut state = self.state.lock().await;
        self.allocate_locked(&mut state, name, force_fresh)
    }

    fn allocate_locked(
        &self,
        state: &mut PortsState,
        name: &str,
        force_fresh: bool,
    ) -> Result<u16, ProxyPortsError> {
        let pp = state.listener(name)?;

        if pp.is_static {
            if pp.proxy_port == 0 {
                return Err(ProxyPortsError::StaticPortUnset(name.to_string()));
            }
            let entry = state.listener_mut(name)?;
            entry.configured = true;
            if !force_fresh || entry.n_pending == 0 {
                entry.n_pending += 1;
            }
            return Ok(pp.proxy_port);
        }

        let current = pp.proxy_port;
        let port = if current != 0 && !force_fresh && state.usable_by(current, name, self.reuse_delay)
        {
            current
        } else {
            if current != 0 {
                state.drop_reservation(current, name);
            }
            if !force_fresh
                && pp.rules_port != 0
                && state.usable_by(pp.rules_port, name, self.reuse_delay)
            {
                pp.rules_port
            } else {
                state
                    .next_free(current, self.range_min, self.range_max, self.reuse_delay)
                    .ok_or(ProxyPortsError::PoolExhausted {
                        min: self.range_min,
                        max: self.range_max,
                    })?
            }
        };

        state.reserve(port, name);
        let entry = state.listener_mut(name)?;
        entry.proxy_port = port;
        entry.configured = true;
        if !force_fresh || entry.n_pending == 0 {
            entry.n_pending += 1;
        }

        debug!(
            listener = %name,
            proxy_port = port,
            previous_port = current,
            force_fresh,
            n_pending = entry.n_pending,
            "Allocated proxy port"
        );

        Ok(port)
    }

    /// Undo an allocation that was never acknowledged.
    ///
    /// While other allocations on the listener are still pending, only this
    /// one is forgotten and the port stays as it is. Otherwise the port is
    /// not handed back to the pool for other listeners until the reuse delay
    /// has passed, and acknowledged listeners fall back to the port the
    /// datapath already uses.
    pub async fn reset(&self, name: &str) {
        let mut state = self.state.lock().await;
        let Ok(pp) = state.listener(name) else {
            debug!(listener = %name, "Reset of unknown proxy listener ignored");
            return;
        };

        if pp.n_pending > 1 {
            if let Some(entry) = state.listeners.get_mut(name) {
                entry.n_pending -= 1;
                debug!(
                    listener = %name,
                    proxy_port = entry.proxy_port,
                    n_pending = entry.n_pending,
                    "Reset deferred to pending allocations"
                );
            }
            return;
        }
        if let Some(entry) = state.listeners.get_mut(name) {
            entry.n_pending = 0;
        }

        if pp.is_static {
            if pp.n_redirects == 0 {
                if let Some(entry) = state.listeners.get_mut(name) {
                    entry.configured = false;
                }
            }
            return;
        }

        if pp.proxy_port != 0 && (pp.proxy_port != pp.rules_port || !pp.acknowledged) {
            state.drop_reservation(pp.proxy_port, name);
        }

        if let Some(entry) = state.listeners.get_mut(name) {
            if pp.acknowledged {
                entry.proxy_port = pp.rules_port;
            } else {
                entry.proxy_port = 0;
                entry.configured = false;
            }
        }

        debug!(listener = %name, proxy_port = pp.proxy_port, "Reset proxy port");
    }

    /// Acknowledge the listener's port and take a reference on it.
    ///
    /// Installs datapath rules if they do not yet point at the current port.
    pub async fn ack_proxy_port_with_reference(&self, name: &str) -> Result<(), ProxyPortsError> {
        self.ack(name, true).await
    }

    /// Acknowledge the listener's port without taking a reference.
    pub async fn ack_proxy_port(&self, name: &str) -> Result<(), ProxyPortsError> {
        self.ack(name, false).await
    }

    async fn ack(&self, name: &str, take_reference: bool) -> Result<(), ProxyPortsError> {
        let mut state = self.state.lock().await;
        let pp = state.listener(name)?;

        if !pp.configured || pp.proxy_port == 0 {
            return Err(ProxyPortsError::NotConfigured(name.to_string()));
        }

        if !pp.acknowledged || pp.rules_port != pp.proxy_port {
            self.datapath
                .install_proxy_rules(pp.proxy_port, pp.ingress, name)
                .await?;

            if !pp.is_static && pp.rules_port != 0 && pp.rules_port != pp.proxy_port {
                state.retire(pp.rules_port, name);
            }
        }

        if !pp.is_static {
            state.ports.insert(
                pp.proxy_port,
                PortEntry {
                    owner: name.to_string(),
                    state: PortState::InUse,
                },
            );
        }

        let entry = state.listener_mut(name)?;
        entry.rules_port = entry.proxy_port;
        entry.acknowledged = true;
        entry.n_pending = entry.n_pending.saturating_sub(1);
        if take_reference {
            entry.n_redirects += 1;
        }

        debug!(
            listener = %name,
            proxy_port = entry.proxy_port,
            n_redirects = entry.n_redirects,
            "Acknowledged proxy port"
        );

        Ok(())
    }

    /// Drop one reference on the listener's port.
    ///
    /// When the last reference goes and no allocation is pending, the port is
    /// held back for the reuse delay and CRD listeners are forgotten.
    pub async fn release_proxy_port(&self, name: &str) -> Result<(), ProxyPortsError> {
        let mut state = self.state.lock().await;
        let entry = state.listener_mut(name)?;

        if entry.n_redirects == 0 {
            return Err(ProxyPortsError::NotReferenced(name.to_string()));
        }

        entry.n_redirects -= 1;
        if entry.n_redirects > 0 || entry.n_pending > 0 {
            debug!(
                listener = %name,
                n_redirects = entry.n_redirects,
                n_pending = entry.n_pending,
                "Dropped proxy port reference"
            );
            return Ok(());
        }

        let port = entry.proxy_port;
        let is_static = entry.is_static;
        let is_crd = entry.proxy_type == ProxyType::Crd;
        if !is_static {
            entry.proxy_port = 0;
        }
        entry.configured = false;
        entry.acknowledged = false;

        if !is_static && port != 0 {
            state.retire(port, name);
        }
        if is_crd {
            state.listeners.remove(name);
        }

        info!(listener = %name, proxy_port = port, "Released proxy port");
        Ok(())
    }

    /// Allocate (or return the existing) port for a CRD listener.
    ///
    /// Creates the listener on first use. Must be paired with an
    /// acknowledgement and eventually a release.
    pub async fn allocate_crd_proxy_port(&self, name: &str) -> Result<u16, ProxyPortsError> {
        let mut state = self.state.lock().await;

        let existing = state
            .listeners
            .entry(name.to_string())
            .or_insert_with(|| ProxyPort::new(ProxyType::Crd, false, false));
        if existing.proxy_type != ProxyType::Crd {
            return Err(ProxyPortsError::Conflict {
                name: name.to_string(),
                existing: existing.proxy_type.to_string(),
            });
        }

        if existing.configured && existing.proxy_port != 0 {
            return Ok(existing.proxy_port);
        }

        self.allocate_locked(&mut state, name, false)
    }

    /// Record the port of a listener that binds its own (static) port.
    pub async fn set_proxy_port(
        &self,
        name: &str,
        proxy_type: ProxyType,
        port: u16,
        ingress: bool,
    ) -> Result<(), ProxyPortsError> {
        if port == 0 {
            return Err(ProxyPortsError::InvalidPort(format!(
                "static port for {} must be non-zero",
                name
            )));
        }

        let mut state = self.state.lock().await;
        let entry = state
            .listeners
            .entry(name.to_string())
            .or_insert_with(|| ProxyPort::new_static(proxy_type, ingress, false));

        if entry.proxy_type != proxy_type || entry.ingress != ingress {
            return Err(ProxyPortsError::Conflict {
                name: name.to_string(),
                existing: format!("{} {}", entry.proxy_type, entry.direction()),
            });
        }

        if entry.is_static && entry.proxy_port != 0 && entry.proxy_port != port {
            warn!(
                listener = %name,
                old_port = entry.proxy_port,
                new_port = port,
                "Static proxy port changed"
            );
        }

        entry.is_static = true;
        entry.proxy_port = port;
        entry.configured = true;

        info!(listener = %name, proxy_port = port, proxy_type = %proxy_type, "Static proxy port set");
        Ok(())
    }

    /// Current port of a listener and whether it is static.
    pub async fn get_proxy_port(&self, name: &str) -> Result<(u16, bool), ProxyPortsError> {
        let state = self.state.lock().await;
        let pp = state.listener(name)?;
        Ok((pp.proxy_port, pp.is_static))
    }

    /// Port the datapath currently redirects the listener to, 0 if none.
    pub async fn get_rules_port(&self, name: &str) -> u16 {
        let state = self.state.lock().await;
        state.listeners.get(name).map(|pp| pp.rules_port).unwrap_or(0)
    }

    /// Port range and number of ports currently reserved or in use.
    pub async fn status_info(&self) -> (u16, u16, usize) {
        let state = self.state.lock().await;
        (self.range_min, self.range_max, state.ports_in_use())
    }
}

impl std::fmt::Debug for ProxyPorts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyPorts")
            .field("range_min", &self.range_min)
            .field("range_max", &self.range_max)
            .field("reuse_delay", &self.reuse_delay)
            .finish_non_exhaustive()
    }
}
