//! The subdomain → live tunnel table.
//!
//! Process-wide, created once at startup, shared as `Arc<TunnelRegistry>`.
//! At most one tunnel per subdomain: a connecting agent that authenticates as
//! an already-connected subdomain evicts the old connection. A reader racing
//! a replacement may briefly hold the displaced tunnel; calls through it fail
//! with "tunnel closed" rather than misrouting.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::{info, warn};

use crate::server::tunnel::Tunnel;
use crate::store::Store;

/// Registry snapshot for the status endpoint.
#[derive(Debug, Serialize)]
pub struct RegistryStats {
    pub active_tunnels: usize,
    pub subdomains: Vec<String>,
}

pub struct TunnelRegistry {
    tunnels: RwLock<HashMap<String, Arc<Tunnel>>>,
    store: Arc<Store>,
}

impl TunnelRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            tunnels: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Install a tunnel for its subdomain, closing any tunnel it displaces,
    /// and mark the device online. The displaced tunnel's own run loop takes
    /// care of its unregister path, which no-ops because the entry has
    /// already been replaced.
    pub fn register(&self, tunnel: Arc<Tunnel>) {
        let subdomain = tunnel.device.subdomain.clone();
        let displaced = {
            let mut tunnels = self.tunnels.write().expect("registry lock poisoned");
            tunnels.insert(subdomain.clone(), Arc::clone(&tunnel))
        };
        if let Some(old) = displaced {
            warn!(subdomain = %subdomain, "Agent re-connected, evicting old tunnel");
            old.close();
        }
        self.store.set_online(&tunnel.device.id, true);
        info!(
            subdomain = %subdomain,
            device = %&tunnel.device.id[..8.min(tunnel.device.id.len())],
            "Tunnel registered"
        );
    }

    /// Remove the mapping only if the current entry is identically `tunnel`,
    /// so unregistering a displaced tunnel never undoes its replacement.
    pub fn unregister(&self, tunnel: &Arc<Tunnel>) {
        let subdomain = &tunnel.device.subdomain;
        let removed = {
            let mut tunnels = self.tunnels.write().expect("registry lock poisoned");
            match tunnels.get(subdomain) {
                Some(current) if Arc::ptr_eq(current, tunnel) => {
                    tunnels.remove(subdomain);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.store.set_online(&tunnel.device.id, false);
            info!(subdomain = %subdomain, "Tunnel unregistered");
        }
    }

    /// Current tunnel for a subdomain, atomically with register/unregister.
    pub fn get(&self, subdomain: &str) -> Option<Arc<Tunnel>> {
        self.tunnels
            .read()
            .expect("registry lock poisoned")
            .get(subdomain)
            .cloned()
    }

    /// Snapshot of active subdomains.
    pub fn stats(&self) -> RegistryStats {
        let tunnels = self.tunnels.read().expect("registry lock poisoned");
        let mut subdomains: Vec<String> = tunnels.keys().cloned().collect();
        subdomains.sort();
        RegistryStats {
            active_tunnels: subdomains.len(),
            subdomains,
        }
    }
}
