//! Shared data model for the shardkv workspace: shard/node identifiers, the
//! student row shape, and the shard descriptor that the router and the
//! replica engine both need to agree on. No I/O lives here.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a replica process (a "server" in cluster terminology).
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Identifier of a shard. Shards are named, not numbered, per the source
/// system's `shard_id` strings ("sh1", "sh2", ...).
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ShardId(pub String);

impl ShardId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ShardId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A single student record as clients see it: no versioning metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentRow {
    pub stud_id: i64,
    pub stud_name: String,
    pub stud_marks: i64,
}

/// A row version as stored on a replica: adds the shard it belongs to and
/// the `created_at`/`deleted_at` term stamps that make the store append-only.
///
/// Primary key is `(stud_id, created_at)`. A row is live iff `deleted_at` is
/// `None`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowVersion {
    pub stud_id: i64,
    pub stud_name: String,
    pub stud_marks: i64,
    pub shard_id: ShardId,
    pub created_at: u64,
    pub deleted_at: Option<u64>,
}

impl RowVersion {
    pub fn student(&self) -> StudentRow {
        StudentRow {
            stud_id: self.stud_id,
            stud_name: self.stud_name.clone(),
            stud_marks: self.stud_marks,
        }
    }

    pub fn is_live_at(&self, valid_at: u64) -> bool {
        self.created_at <= valid_at && self.deleted_at.map(|d| d > valid_at).unwrap_or(true)
    }
}

/// A contiguous half-open key range `[low, low + size)` together with the
/// set of replicas currently holding it and the monotonic `valid_at` counter
/// that defines the shard's global logical time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShardDescriptor {
    pub shard_id: ShardId,
    pub low: i64,
    pub size: i64,
    pub valid_at: u64,
    pub replicas: Vec<NodeId>,
}

impl ShardDescriptor {
    pub fn high(&self) -> i64 {
        self.low + self.size - 1
    }

    pub fn contains(&self, stud_id: i64) -> bool {
        stud_id >= self.low && stud_id < self.low + self.size
    }

    /// Whether this shard's key interval intersects `[low, high]`.
    pub fn intersects(&self, low: i64, high: i64) -> bool {
        !(self.high() < low || self.low > high)
    }
}

/// The shard descriptor shape used as `/init` input, before any replicas or
/// `valid_at` bookkeeping have been assigned.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShardSpec {
    pub shard_id: ShardId,
    pub stud_id_low: i64,
    pub shard_size: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(low: i64, size: i64) -> ShardDescriptor {
        ShardDescriptor {
            shard_id: ShardId::new("sh"),
            low,
            size,
            valid_at: 0,
            replicas: vec![],
        }
    }

    #[test]
    fn contains_is_half_open() {
        let s = shard(0, 1000);
        assert!(s.contains(0));
        assert!(s.contains(999));
        assert!(!s.contains(1000));
    }

    #[test]
    fn intersects_checks_both_edges() {
        let s = shard(1000, 1000); // [1000, 2000)
        assert!(s.intersects(500, 1000));
        assert!(s.intersects(1999, 2500));
        assert!(!s.intersects(0, 999));
        assert!(!s.intersects(2000, 3000));
    }

    #[test]
    fn row_version_live_at_horizon() {
        let row = RowVersion {
            stud_id: 1,
            stud_name: "A".into(),
            stud_marks: 10,
            shard_id: ShardId::new("sh1"),
            created_at: 5,
            deleted_at: Some(7),
        };
        assert!(!row.is_live_at(4));
        assert!(row.is_live_at(5));
        assert!(row.is_live_at(6));
        assert!(!row.is_live_at(7));
    }
}
