//! A consistent hash ring with linear-probing virtual node placement.
//!
//! `TOTAL_SLOTS` slots, `K = log2(TOTAL_SLOTS)` virtual nodes per server,
//! MD5-hashed slot assignment, and clockwise lookup. Used both as the sole
//! routing mechanism in stateless deployments and as placement bookkeeping
//! underneath the replicated shard router (`shardkv-cluster`).
//!
//! The hash function is pinned to MD5-of-UTF8-bytes-as-big-endian-integer so
//! that routing is bit-identical across restarts.

use std::collections::BTreeMap;
use std::collections::HashSet;

use thiserror::Error;

/// Default ring size.
pub const DEFAULT_TOTAL_SLOTS: u32 = 512;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    #[error("hash ring is full")]
    Full,
}

/// Consistent hash ring over string-named servers.
///
/// `ring` maps occupied slot -> owning server. A `BTreeMap` gives us sorted
/// clockwise iteration for free, standing in for the source's
/// `sorted_slots` list kept ordered via `bisect.insort`.
#[derive(Debug, Clone)]
pub struct HashRing {
    total_slots: u32,
    virtual_nodes: u32,
    ring: BTreeMap<u32, String>,
    members: HashSet<String>,
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(DEFAULT_TOTAL_SLOTS)
    }
}

impl HashRing {
    /// Build a ring with `total_slots` slots. `total_slots` must be a power
    /// of two; `K` (virtual nodes per server) is derived as its log2.
    pub fn new(total_slots: u32) -> Self {
        assert!(total_slots.is_power_of_two(), "total_slots must be a power of two");
        Self {
            total_slots,
            virtual_nodes: total_slots.trailing_zeros(),
            ring: BTreeMap::new(),
            members: HashSet::new(),
        }
    }

    pub fn total_slots(&self) -> u32 {
        self.total_slots
    }

    pub fn virtual_nodes(&self) -> u32 {
        self.virtual_nodes
    }

    fn hash_mod(key: &str) -> u128 {
        let digest = md5::compute(key.as_bytes());
        u128::from_be_bytes(digest.0)
    }

    fn request_slot(&self, key: &str) -> u32 {
        (Self::hash_mod(key) % self.total_slots as u128) as u32
    }

    fn virtual_node_slot(&self, server: &str, replica: u32) -> u32 {
        let key = format!("server-{server}-replica-{replica}");
        (Self::hash_mod(&key) % self.total_slots as u128) as u32
    }

    /// Insert `K` virtual nodes for `server`, resolving collisions by linear
    /// probing. Idempotent: adding an already-live server is a no-op.
    pub fn add(&mut self, server: impl Into<String>) -> Result<(), RingError> {
        let server = server.into();
        if self.members.contains(&server) {
            return Ok(());
        }

        for replica in 0..self.virtual_nodes {
            let start = self.virtual_node_slot(&server, replica);
            let mut slot = start;
            while self.ring.contains_key(&slot) {
                slot = (slot + 1) % self.total_slots;
                if slot == start {
                    return Err(RingError::Full);
                }
            }
            self.ring.insert(slot, server.clone());
        }
        self.members.insert(server);
        Ok(())
    }

    /// Remove every slot owned by `server`. A no-op if the server isn't live.
    ///
    /// Collisions are resolved by linear probing at insert time, so a slot's
    /// position is not a deterministic function of `server` alone — removal
    /// must scan the occupied slots for the owner rather than recomputing
    /// hashes.
    pub fn remove(&mut self, server: &str) {
        if !self.members.remove(server) {
            return;
        }
        self.ring.retain(|_, owner| owner != server);
    }

    /// Resolve `key` to the owner of the nearest occupied slot clockwise
    /// from `hash(key)`, wrapping around the ring. `None` if the ring has no
    /// live servers.
    pub fn lookup(&self, key: &str) -> Option<String> {
        if self.ring.is_empty() {
            return None;
        }
        let slot = self.request_slot(key);
        self.ring
            .range(slot..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, owner)| owner.clone())
    }

    /// The clockwise successor of `server` whose owner differs from it.
    /// `None` if the ring has fewer than two distinct owners, or if `server`
    /// has no virtual nodes on the ring.
    pub fn next_of(&self, server: &str) -> Option<String> {
        let start_slot = *self.ring.iter().find(|(_, owner)| *owner == server)?.0;
        let total = self.ring.len();
        let mut iter = self
            .ring
            .range(start_slot + 1..)
            .chain(self.ring.range(..=start_slot));
        for _ in 0..total {
            if let Some((_, owner)) = iter.next() {
                if owner != server {
                    return Some(owner.clone());
                }
            }
        }
        None
    }

    /// Unordered set of live server names.
    pub fn members(&self) -> Vec<String> {
        self.members.iter().cloned().collect()
    }

    pub fn is_member(&self, server: &str) -> bool {
        self.members.contains(server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn add_then_members_matches() {
        let mut ring = HashRing::default();
        ring.add("s1").unwrap();
        ring.add("s2").unwrap();
        ring.add("s3").unwrap();
        let mut members = ring.members();
        members.sort();
        assert_eq!(members, vec!["s1", "s2", "s3"]);
    }

    #[test]
    fn add_is_idempotent() {
        let mut ring = HashRing::default();
        ring.add("s1").unwrap();
        let before = ring.ring.len();
        ring.add("s1").unwrap();
        assert_eq!(ring.ring.len(), before);
    }

    #[test]
    fn remove_drops_only_that_server() {
        let mut ring = HashRing::default();
        ring.add("s1").unwrap();
        ring.add("s2").unwrap();
        ring.remove("s1");
        assert_eq!(ring.members(), vec!["s2".to_string()]);
        assert!(ring.ring.values().all(|owner| owner == "s2"));
    }

    #[test]
    fn lookup_is_deterministic_across_identical_build_order() {
        let mut a = HashRing::default();
        let mut b = HashRing::default();
        for s in ["s1", "s2", "s3", "s4"] {
            a.add(s).unwrap();
            b.add(s).unwrap();
        }
        for key in ["1", "42", "1000000", "student-7"] {
            assert_eq!(a.lookup(key), b.lookup(key));
        }
    }

    #[test]
    fn lookup_empty_ring_is_none() {
        let ring = HashRing::default();
        assert_eq!(ring.lookup("anything"), None);
    }

    #[test]
    fn add_remove_roundtrip_leaves_exact_remainder() {
        let mut ring = HashRing::default();
        let all: Vec<String> = (0..20).map(|i| format!("server-{i}")).collect();
        for s in &all {
            ring.add(s).unwrap();
        }
        let removed: Vec<&String> = all.iter().step_by(3).collect();
        for s in &removed {
            ring.remove(s);
        }
        let mut remaining: Vec<String> = all
            .iter()
            .filter(|s| !removed.contains(s))
            .cloned()
            .collect();
        remaining.sort();
        let mut got = ring.members();
        got.sort();
        assert_eq!(got, remaining);

        for i in 0..500 {
            if let Some(owner) = ring.lookup(&i.to_string()) {
                assert!(remaining.contains(&owner));
            }
        }
    }

    #[test]
    fn next_of_returns_different_owner() {
        let mut ring = HashRing::default();
        ring.add("s1").unwrap();
        ring.add("s2").unwrap();
        ring.add("s3").unwrap();
        let next = ring.next_of("s1").unwrap();
        assert_ne!(next, "s1");
        assert!(ring.is_member(&next));
    }

    #[test]
    fn next_of_single_member_is_none() {
        let mut ring = HashRing::default();
        ring.add("only").unwrap();
        assert_eq!(ring.next_of("only"), None);
    }

    #[test]
    fn next_of_unknown_server_is_none() {
        let mut ring = HashRing::default();
        ring.add("s1").unwrap();
        assert_eq!(ring.next_of("ghost"), None);
    }

    #[test]
    fn ring_full_is_reported() {
        // total_slots must stay a power of two; 8 slots / K=3 virtual nodes
        // each leaves only 8 slots for up to 2-3 servers before collisions
        // can no longer be resolved.
        let mut ring = HashRing::new(8);
        let mut last_err = None;
        for i in 0..20 {
            if let Err(e) = ring.add(format!("s{i}")) {
                last_err = Some(e);
                break;
            }
        }
        assert_eq!(last_err, Some(RingError::Full));
    }

    #[test]
    fn lookup_distribution_is_reasonably_even() {
        // Grounded in original_source/Part-1/load_balancer/test_load_distribution.py:
        // 10,000 random request ids against a 3-server ring, checking no
        // server is wildly over- or under-represented.
        let mut ring = HashRing::default();
        for s in ["Server1", "Server2", "Server3"] {
            ring.add(s).unwrap();
        }
        let mut counts: HashMap<String, u32> = HashMap::new();
        let mut rng_state: u64 = 0x2545F4914F6CDD1D;
        for _ in 0..10_000 {
            // xorshift64 so the test has no external RNG dependency on
            // exact sequence while still covering a wide key range.
            rng_state ^= rng_state << 13;
            rng_state ^= rng_state >> 7;
            rng_state ^= rng_state << 17;
            let request_id = (rng_state % 1_000_000) + 1;
            if let Some(owner) = ring.lookup(&request_id.to_string()) {
                *counts.entry(owner).or_insert(0) += 1;
            }
        }
        assert_eq!(counts.len(), 3);
        for count in counts.values() {
            assert!(*count > 1500, "server handled too few requests: {count}");
            assert!(*count < 5000, "server handled too many requests: {count}");
        }
    }
}
