//! The shard table: shard geometry, current `valid_at`/replica set per
//! shard, and the one-mutex-per-shard serialization the router uses for
//! mutations. No global mutex — each shard's mutations are totally ordered
//! independently of every other shard's.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

use shardkv_core::{NodeId, ShardId, ShardSpec};

use crate::error::ClusterError;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ShardGeometry {
    shard_id: ShardId,
    low: i64,
    size: i64,
}

impl ShardGeometry {
    fn contains(&self, stud_id: i64) -> bool {
        stud_id >= self.low && stud_id < self.low + self.size
    }

    fn intersects(&self, low: i64, high: i64) -> bool {
        let shard_high = self.low + self.size - 1;
        !(shard_high < low || self.low > high)
    }
}

/// The mutable, frequently-read half of a shard's table entry. Reads take a
/// brief `std::sync::RwLock` read guard to snapshot this; they never wait on
/// the write-serializing `AsyncMutex` below.
#[derive(Clone, Debug, Default)]
pub struct ShardRuntime {
    pub valid_at: u64,
    pub replicas: Vec<NodeId>,
}

struct ShardEntry {
    geometry: ShardGeometry,
    runtime: RwLock<ShardRuntime>,
    write_lock: AsyncMutex<()>,
}

/// A point-in-time, lock-free view of a shard returned to callers that only
/// need to read or report state.
#[derive(Clone, Debug, Serialize)]
pub struct ShardView {
    pub shard_id: ShardId,
    pub low: i64,
    pub size: i64,
    pub valid_at: u64,
    pub replicas: Vec<NodeId>,
}

pub struct ShardTable {
    entries: RwLock<HashMap<ShardId, Arc<ShardEntry>>>,
}

impl Default for ShardTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardTable {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Install the shard layout from an `/init` call: `servers` maps a
    /// server name to the shard ids it was asked to hold, inverted here to
    /// shard_id -> list of servers, persisted with `valid_at = 0`.
    pub fn init(&self, shards: &[ShardSpec], servers: &HashMap<String, Vec<ShardId>>) {
        let mut inverted: HashMap<ShardId, Vec<NodeId>> = HashMap::new();
        for (server, shard_ids) in servers {
            for shard_id in shard_ids {
                inverted
                    .entry(shard_id.clone())
                    .or_default()
                    .push(NodeId::new(server.clone()));
            }
        }

        let mut entries = self.entries.write().unwrap();
        for spec in shards {
            let replicas = inverted.remove(&spec.shard_id).unwrap_or_default();
            entries.insert(
                spec.shard_id.clone(),
                Arc::new(ShardEntry {
                    geometry: ShardGeometry {
                        shard_id: spec.shard_id.clone(),
                        low: spec.stud_id_low,
                        size: spec.shard_size,
                    },
                    runtime: RwLock::new(ShardRuntime {
                        valid_at: 0,
                        replicas,
                    }),
                    write_lock: AsyncMutex::new(()),
                }),
            );
        }
    }

    fn entry(&self, shard_id: &ShardId) -> Option<Arc<ShardEntry>> {
        self.entries.read().unwrap().get(shard_id).cloned()
    }

    /// Resolve `stud_id` to its owning shard, if any shard's interval
    /// covers it.
    pub fn shard_for_stud_id(&self, stud_id: i64) -> Result<ShardId, ClusterError> {
        self.entries
            .read()
            .unwrap()
            .values()
            .find(|entry| entry.geometry.contains(stud_id))
            .map(|entry| entry.geometry.shard_id.clone())
            .ok_or(ClusterError::OutOfRange(stud_id))
    }

    /// All shards whose interval intersects `[low, high]`, used by `/read`
    /// to compute the covering shard set.
    pub fn covering_shards(&self, low: i64, high: i64) -> Vec<ShardId> {
        let mut ids: Vec<ShardId> = self
            .entries
            .read()
            .unwrap()
            .values()
            .filter(|entry| entry.geometry.intersects(low, high))
            .map(|entry| entry.geometry.shard_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Lock-free snapshot of one shard's current `valid_at` and replica set.
    pub fn view(&self, shard_id: &ShardId) -> Option<ShardView> {
        let entry = self.entry(shard_id)?;
        let runtime = entry.runtime.read().unwrap();
        Some(ShardView {
            shard_id: entry.geometry.shard_id.clone(),
            low: entry.geometry.low,
            size: entry.geometry.size,
            valid_at: runtime.valid_at,
            replicas: runtime.replicas.clone(),
        })
    }

    pub fn all_views(&self) -> Vec<ShardView> {
        self.entries
            .read()
            .unwrap()
            .keys()
            .cloned()
            .collect::<Vec<_>>()
            .iter()
            .filter_map(|id| self.view(id))
            .collect()
    }

    /// Acquire the per-shard write-serializing lock, run `f` with the
    /// current snapshot, persist the snapshot `f` returns, and release. `f`
    /// computes `new_vat` and performs the replica fan-out; holding the lock
    /// across that await is what gives mutations on one shard a total order.
    pub async fn with_shard_locked<F, Fut>(
        &self,
        shard_id: &ShardId,
        f: F,
    ) -> Result<ShardView, ClusterError>
    where
        F: FnOnce(ShardView) -> Fut,
        Fut: std::future::Future<Output = ShardRuntime>,
    {
        let entry = self
            .entry(shard_id)
            .ok_or_else(|| ClusterError::UnknownShard(shard_id.clone()))?;
        let _guard = entry.write_lock.lock().await;

        let before = {
            let runtime = entry.runtime.read().unwrap();
            ShardView {
                shard_id: entry.geometry.shard_id.clone(),
                low: entry.geometry.low,
                size: entry.geometry.size,
                valid_at: runtime.valid_at,
                replicas: runtime.replicas.clone(),
            }
        };

        let after = f(before).await;

        {
            let mut runtime = entry.runtime.write().unwrap();
            *runtime = after;
        }

        Ok(self.view(shard_id).expect("shard present under its own lock"))
    }

    /// Append `replica` to a shard's replica list (used by `/add` and by
    /// recovery once a replacement has been seeded).
    pub fn add_replica(&self, shard_id: &ShardId, replica: NodeId) {
        if let Some(entry) = self.entry(shard_id) {
            let mut runtime = entry.runtime.write().unwrap();
            if !runtime.replicas.contains(&replica) {
                runtime.replicas.push(replica);
            }
        }
    }

    /// Scrub `replica` from every shard's replica list (used by `/rm` and by
    /// recovery when a dead replica is removed).
    pub fn remove_replica_everywhere(&self, replica: &NodeId) {
        for entry in self.entries.read().unwrap().values() {
            let mut runtime = entry.runtime.write().unwrap();
            runtime.replicas.retain(|r| r != replica);
        }
    }

    /// Shards whose replica list currently contains `replica`, used by
    /// recovery to snapshot what a dead server was holding before removal.
    pub fn shards_held_by(&self, replica: &NodeId) -> Vec<ShardId> {
        self.entries
            .read()
            .unwrap()
            .values()
            .filter(|entry| entry.runtime.read().unwrap().replicas.contains(replica))
            .map(|entry| entry.geometry.shard_id.clone())
            .collect()
    }
}
