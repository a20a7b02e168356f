//! Part-1 stateless ring routing mode (see `original_source/Part-1`): no
//! shard table, no replication, no per-shard lock — the ring alone maps a
//! request id directly to the one server that owns it. Additive to the
//! replicated (Part-2) mode the rest of this crate implements; a coordinator
//! picks one or the other at `/init` time.

use std::sync::RwLock;

use shardkv_ring::{HashRing, RingError};

/// Thread-safe wrapper around `HashRing` for the stateless deployment shape.
pub struct StatelessRouter {
    ring: RwLock<HashRing>,
}

impl Default for StatelessRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatelessRouter {
    pub fn new() -> Self {
        Self {
            ring: RwLock::new(HashRing::default()),
        }
    }

    pub fn add(&self, server: impl Into<String>) -> Result<(), RingError> {
        self.ring.write().unwrap().add(server)
    }

    pub fn remove(&self, server: &str) {
        self.ring.write().unwrap().remove(server);
    }

    /// Resolve a request id (e.g. a `stud_id`) to the single server that
    /// should handle it. `None` if no server has been added yet.
    pub fn route(&self, request_id: &str) -> Option<String> {
        self.ring.read().unwrap().lookup(request_id)
    }

    pub fn members(&self) -> Vec<String> {
        self.ring.read().unwrap().members()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_to_a_live_member() {
        let router = StatelessRouter::new();
        router.add("Server1").unwrap();
        router.add("Server2").unwrap();
        let owner = router.route("12345").unwrap();
        assert!(router.members().contains(&owner));
    }

    #[test]
    fn empty_router_routes_nowhere() {
        let router = StatelessRouter::new();
        assert_eq!(router.route("1"), None);
    }
}
