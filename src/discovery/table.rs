//! Discovery-driven routing table.
//!
//! For each service type, maps `service_key` (`name + "-" + cluster`) to the
//! ordered list of healthy nodes. Only the discovery watcher mutates the
//! table; readers take the shared lock. The agent→forward-port bookkeeping
//! lives under the same lock because the same watcher maintains it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;

use tracing::{debug, info};

use crate::types::{ServiceNode, ServiceType, DEFAULT_CLUSTER};

/// Healthy nodes per service key, one map per service type.
pub type NodesByType = Vec<HashMap<String, BTreeSet<ServiceNode>>>;

struct Inner {
    by_type: Vec<HashMap<String, Vec<ServiceNode>>>,
    ports_by_agent: HashMap<String, BTreeSet<u16>>,
}

/// Shared routing state.
pub struct RoutingTable {
    inner: RwLock<Inner>,
    cluster: RwLock<String>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingTable {
    pub fn new() -> Self {
        RoutingTable {
            inner: RwLock::new(Inner {
                by_type: (0..ServiceType::COUNT).map(|_| HashMap::new()).collect(),
                ports_by_agent: HashMap::new(),
            }),
            cluster: RwLock::new(DEFAULT_CLUSTER.to_string()),
        }
    }

    pub fn current_cluster(&self) -> String {
        self.cluster.read().expect("cluster lock poisoned").clone()
    }

    /// Updates the active cluster tag. Empty names are ignored.
    pub fn set_cluster(&self, name: &str) {
        if name.is_empty() {
            info!("empty cluster name ignored");
            return;
        }
        let mut cluster = self.cluster.write().expect("cluster lock poisoned");
        if *cluster != name {
            info!(cluster = name, "forward cluster changed");
            *cluster = name.to_string();
        }
    }

    /// Round-robin resolution of `service_name` in the active cluster.
    pub fn resolve(
        &self,
        balance_index: usize,
        service_name: &str,
        service_type: ServiceType,
    ) -> Option<ServiceNode> {
        let key = format!("{}-{}", service_name, self.current_cluster());
        let inner = self.inner.read().expect("routing table poisoned");
        let nodes = inner.by_type[service_type.index()].get(&key)?;
        if nodes.is_empty() {
            debug!(service_key = %key, "service not found");
            return None;
        }
        Some(nodes[balance_index % nodes.len()].clone())
    }

    /// Replaces one service's entries with a fresh health-poll result.
    /// `seen_keys` carries the service keys this watcher has ever installed,
    /// so renamed or drained keys disappear from every type map.
    pub fn apply_health_update(&self, seen_keys: &mut HashSet<String>, update: NodesByType) {
        let mut inner = self.inner.write().expect("routing table poisoned");
        for (type_index, fresh) in update.into_iter().enumerate() {
            for stale in seen_keys.iter() {
                inner.by_type[type_index].remove(stale);
            }
            for (key, nodes) in fresh {
                debug!(type_index, service_key = %key, nodes = nodes.len(), "service added");
                inner.by_type[type_index].insert(key.clone(), nodes.into_iter().collect());
                seen_keys.insert(key);
            }
        }
    }

    /// Replaces the agent→port map with the watcher's latest view.
    pub fn set_agent_ports(&self, ports: HashMap<String, BTreeSet<u16>>) {
        let mut inner = self.inner.write().expect("routing table poisoned");
        inner.ports_by_agent = ports;
    }

    /// Ports the given agent currently uses.
    pub fn related_forward_ports(&self, agent_id: &str) -> Vec<u16> {
        let inner = self.inner.read().expect("routing table poisoned");
        inner
            .ports_by_agent
            .get(agent_id)
            .map(|ports| ports.iter().copied().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn install(&self, service_type: ServiceType, key: &str, nodes: Vec<ServiceNode>) {
        let mut inner = self.inner.write().expect("routing table poisoned");
        inner.by_type[service_type.index()].insert(key.to_string(), nodes);
    }
}
