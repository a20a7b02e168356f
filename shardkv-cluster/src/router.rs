//! Shard router / replication coordinator (C4).
//!
//! Owns the shard table and fans mutations out to every replica of the
//! target shard under that shard's lock; reads take no lock and scatter
//! against one randomly chosen replica per covering shard. `/add` and `/rm`
//! go through the `ReplicaManager` directly since they change membership,
//! not shard contents.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rand::seq::SliceRandom;
use serde::Serialize;

use shardkv_core::{NodeId, ShardId, ShardSpec, StudentRow};
use shardkv_engine::{KeyRange, WriteRow};

use crate::error::{ClusterError, ReplicaFailure};
use crate::manager::ReplicaManager;
use crate::shard_table::{ShardRuntime, ShardTable, ShardView};
use crate::transport::ReplicaTransport;

/// Retry policy for waiting on a freshly spawned server's heartbeat, shared
/// by `/init` and the recovery driver.
pub const HEARTBEAT_WAIT_RETRIES: u32 = 10;
pub const HEARTBEAT_WAIT_DELAY: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, Serialize, Default)]
pub struct ShardWriteResult {
    pub inserted: usize,
    pub failures: Vec<ReplicaFailure>,
}

pub struct ShardRouter {
    table: Arc<ShardTable>,
    manager: Arc<ReplicaManager>,
    transport: Arc<dyn ReplicaTransport>,
}

impl ShardRouter {
    pub fn new(
        table: Arc<ShardTable>,
        manager: Arc<ReplicaManager>,
        transport: Arc<dyn ReplicaTransport>,
    ) -> Self {
        Self {
            table,
            manager,
            transport,
        }
    }

    pub fn table(&self) -> &Arc<ShardTable> {
        &self.table
    }

    /// `/init`: install the shard geometry and replica placement, then for
    /// every named server spawn it if absent, wait for its heartbeat, and
    /// push `/config`. A server that never heartbeats is logged and skipped,
    /// not fatal to initialization.
    pub async fn init(
        &self,
        shards: Vec<ShardSpec>,
        servers: HashMap<String, Vec<ShardId>>,
    ) -> Vec<ShardView> {
        self.table.init(&shards, &servers);

        for (server_name, shard_list) in &servers {
            let node = NodeId::new(server_name.clone());
            if !self.manager.list().await.contains(&node) {
                if let Err(reason) = self.manager.spawn(&node, None).await {
                    tracing::warn!(node = %node, %reason, "init: failed to spawn server");
                    continue;
                }
            }
            if !self.wait_for_heartbeat(&node).await {
                tracing::warn!(node = %node, "init: server never responded to heartbeat, skipping config");
                continue;
            }
            if let Err(err) = self.transport.config(&node, shard_list).await {
                tracing::warn!(node = %node, %err, "init: /config failed");
            }
        }

        self.table.all_views()
    }

    async fn wait_for_heartbeat(&self, node: &NodeId) -> bool {
        for _ in 0..HEARTBEAT_WAIT_RETRIES {
            if self.transport.heartbeat(node).await {
                return true;
            }
            tokio::time::sleep(HEARTBEAT_WAIT_DELAY).await;
        }
        false
    }

    /// `/write`: resolve each row's shard, fan it out under that shard's
    /// lock, and advance `valid_at` regardless of partial replica failure —
    /// recovery is what repairs an under-replicated shard.
    pub async fn write(
        &self,
        rows: Vec<WriteRow>,
    ) -> Result<HashMap<ShardId, ShardWriteResult>, ClusterError> {
        let mut results: HashMap<ShardId, ShardWriteResult> = HashMap::new();
        for row in rows {
            let shard_id = self.table.shard_for_stud_id(row.stud_id)?;
            let failures = self
                .fan_out(&shard_id, |transport, node, shard, valid_at| {
                    let row = row.clone();
                    async move { transport.write(node, shard, valid_at, &[row], false).await.map(|_| ()) }
                })
                .await?;
            let entry = results.entry(shard_id).or_default();
            entry.inserted += 1;
            entry.failures.extend(failures);
        }
        Ok(results)
    }

    /// `/update`: fan a single-row replacement out to every replica of
    /// `stud_id`'s shard. Returns the shard's new `valid_at` plus any
    /// per-replica failures.
    pub async fn update(
        &self,
        stud_id: i64,
        new_row: WriteRow,
    ) -> Result<(u64, Vec<ReplicaFailure>), ClusterError> {
        let shard_id = self.table.shard_for_stud_id(stud_id)?;
        let failures = self
            .fan_out(&shard_id, move |transport, node, shard, valid_at| {
                let new_row = new_row.clone();
                async move {
                    transport
                        .update(node, shard, valid_at, stud_id, new_row)
                        .await
                        .map(|_| ())
                }
            })
            .await?;
        let valid_at = self
            .table
            .view(&shard_id)
            .map(|v| v.valid_at)
            .ok_or_else(|| ClusterError::UnknownShard(shard_id.clone()))?;
        Ok((valid_at, failures))
    }

    /// `/del`: fan a tombstone out to every replica of `stud_id`'s shard.
    pub async fn delete(&self, stud_id: i64) -> Result<(u64, Vec<ReplicaFailure>), ClusterError> {
        let shard_id = self.table.shard_for_stud_id(stud_id)?;
        let failures = self
            .fan_out(&shard_id, move |transport, node, shard, valid_at| async move {
                transport.delete(node, shard, valid_at, stud_id).await.map(|_| ())
            })
            .await?;
        let valid_at = self
            .table
            .view(&shard_id)
            .map(|v| v.valid_at)
            .ok_or_else(|| ClusterError::UnknownShard(shard_id.clone()))?;
        Ok((valid_at, failures))
    }

    /// Run `op` against every replica of `shard_id` under its write lock,
    /// advancing `valid_at` by exactly one. `op` is called with the shard's
    /// *current* `valid_at` (not the incremented one): the engine stamps
    /// `created_at = max(term, valid_at) + 1`, so passing the pre-increment
    /// horizon makes the row's `created_at` line up with the `new_vat` this
    /// persists, and a later read at that `valid_at` sees it. Fails with
    /// `NoReplicas` without touching `valid_at` if the shard currently has no
    /// replicas.
    async fn fan_out<F, Fut>(
        &self,
        shard_id: &ShardId,
        op: F,
    ) -> Result<Vec<ReplicaFailure>, ClusterError>
    where
        F: Fn(Arc<dyn ReplicaTransport>, &NodeId, &ShardId, u64) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), crate::transport::TransportError>> + Send,
    {
        let failures: Arc<StdMutex<Vec<ReplicaFailure>>> = Arc::new(StdMutex::new(Vec::new()));
        let empty = Arc::new(AtomicBool::new(false));
        let transport = self.transport.clone();

        let failures_for_closure = failures.clone();
        let empty_for_closure = empty.clone();
        self.table
            .with_shard_locked(shard_id, move |before: ShardView| {
                let transport = transport.clone();
                let failures = failures_for_closure.clone();
                let empty = empty_for_closure.clone();
                async move {
                    if before.replicas.is_empty() {
                        empty.store(true, Ordering::SeqCst);
                        return ShardRuntime {
                            valid_at: before.valid_at,
                            replicas: before.replicas,
                        };
                    }
                    let new_vat = before.valid_at + 1;
                    for replica in &before.replicas {
                        if let Err(err) =
                            op(transport.clone(), replica, &before.shard_id, before.valid_at).await
                        {
                            failures
                                .lock()
                                .unwrap()
                                .push(ReplicaFailure::new(replica.to_string(), err));
                        }
                    }
                    ShardRuntime {
                        valid_at: new_vat,
                        replicas: before.replicas,
                    }
                }
            })
            .await?;

        if empty.load(Ordering::SeqCst) {
            return Err(ClusterError::NoReplicas(shard_id.clone()));
        }
        Ok(Arc::try_unwrap(failures).unwrap().into_inner().unwrap())
    }

    /// `/read`: compute the covering shard set, pick one replica per shard
    /// uniformly at random, and best-effort merge their rows. No lock is
    /// held; failures are silently skipped but every queried shard is still
    /// reported.
    pub async fn read(&self, low: i64, high: i64) -> (Vec<ShardId>, Vec<StudentRow>) {
        let shard_ids = self.table.covering_shards(low, high);
        let mut rows = Vec::new();
        for shard_id in &shard_ids {
            let Some(view) = self.table.view(shard_id) else {
                continue;
            };
            let Some(replica) = view.replicas.choose(&mut rand::thread_rng()).cloned() else {
                continue;
            };
            let range = KeyRange { low, high };
            if let Ok(mut found) = self.transport.read(&replica, shard_id, view.valid_at, range).await {
                rows.append(&mut found);
            }
        }
        (shard_ids, rows)
    }

    /// `/add`: spawn each requested hostname not already live, then spawn
    /// `n - hostnames.len()` additional auto-named replicas.
    pub async fn add(&self, n: usize, hostnames: Vec<String>) -> Result<Vec<NodeId>, ClusterError> {
        if hostnames.len() > n {
            return Err(ClusterError::TooManyHostnames {
                got: hostnames.len(),
                n,
            });
        }
        let live = self.manager.list().await;
        for hostname in &hostnames {
            let node = NodeId::new(hostname.clone());
            if !live.contains(&node) {
                if let Err(reason) = self.manager.spawn(&node, None).await {
                    tracing::warn!(node = %node, %reason, "/add: spawn failed");
                }
            }
        }
        for _ in 0..(n - hostnames.len()) {
            let node = self.manager.next_replacement_name();
            if let Err(reason) = self.manager.spawn(&node, None).await {
                tracing::warn!(node = %node, %reason, "/add: auto-spawn failed");
            }
        }
        Ok(self.manager.list().await)
    }

    /// `/rm`: remove each requested hostname that's live, then remove up to
    /// `n - hostnames.len()` additional randomly chosen live replicas.
    pub async fn remove(&self, n: usize, hostnames: Vec<String>) -> Result<Vec<NodeId>, ClusterError> {
        if hostnames.len() > n {
            return Err(ClusterError::TooManyHostnames {
                got: hostnames.len(),
                n,
            });
        }
        let mut removed = Vec::new();
        for hostname in &hostnames {
            let node = NodeId::new(hostname.clone());
            if self.manager.list().await.contains(&node) {
                if let Err(reason) = self.manager.remove(&node).await {
                    tracing::warn!(node = %node, %reason, "/rm: remove failed");
                } else {
                    removed.push(node);
                }
            }
        }
        let remaining = n.saturating_sub(hostnames.len());
        if remaining > 0 {
            let extra = self.manager.random_replicas(remaining, &removed).await;
            for node in extra {
                if let Err(reason) = self.manager.remove(&node).await {
                    tracing::warn!(node = %node, %reason, "/rm: random remove failed");
                }
            }
        }
        Ok(self.manager.list().await)
    }

    pub async fn replicas(&self) -> Vec<NodeId> {
        self.manager.list().await
    }
}
