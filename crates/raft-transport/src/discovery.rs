//! # discovery
//!
//! why: node ids are stable, socket addresses are not
//! relations: RpcClient resolves its target through this on every reconnect,
//!            so an address change heals itself on the next attempt
//! what: the Discovery trait and the static-map implementation

use std::collections::HashMap;
use std::net::SocketAddr;

use raft_core::NodeId;

/// maps node ids to socket addresses
pub trait Discovery: Send + Sync {
    fn resolve(&self, node: NodeId) -> Option<SocketAddr>;
}

/// a fixed id-to-address table, the common case for small clusters
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    addresses: HashMap<NodeId, SocketAddr>,
}

impl StaticDiscovery {
    pub fn new(addresses: HashMap<NodeId, SocketAddr>) -> Self {
        Self { addresses }
    }
}

impl FromIterator<(NodeId, SocketAddr)> for StaticDiscovery {
    fn from_iter<I: IntoIterator<Item = (NodeId, SocketAddr)>>(iter: I) -> Self {
        Self {
            addresses: iter.into_iter().collect(),
        }
    }
}

impl Discovery for StaticDiscovery {
    fn resolve(&self, node: NodeId) -> Option<SocketAddr> {
        self.addresses.get(&node).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_discovery_resolves_known_ids_only() {
        let discovery: StaticDiscovery =
            [(1u64, "127.0.0.1:7001".parse().unwrap())].into_iter().collect();
        assert!(discovery.resolve(1).is_some());
        assert!(discovery.resolve(2).is_none());
    }
}
