//! Replica manager (C3): the live replica set, heartbeat-failure tracking,
//! auto-generated replacement names, and the spawn/remove concurrency
//! limit. The heartbeat loop only *detects* dead replicas; it reports them
//! on a channel so the recovery driver (C5) can repair them without the two
//! concerns sharing a call stack.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{info, warn};

use shardkv_core::{NodeId, ShardId};

use crate::shard_table::ShardTable;
use crate::spawner::ReplicaSpawner;
use crate::transport::ReplicaTransport;

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_MAX_FAILS: u32 = 3;
const DEFAULT_SPAWN_PERMITS: usize = 5;

pub struct ManagerConfig {
    pub heartbeat_interval: Duration,
    pub max_fails: u32,
    pub spawn_permits: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_fails: DEFAULT_MAX_FAILS,
            spawn_permits: DEFAULT_SPAWN_PERMITS,
        }
    }
}

struct LiveSet {
    replicas: Vec<NodeId>,
    fail_counts: HashMap<NodeId, u32>,
}

/// Tracks live replicas, drives spawn/remove under a concurrency limit, and
/// runs the heartbeat loop that feeds dead-replica events to recovery.
pub struct ReplicaManager {
    config: ManagerConfig,
    live: Mutex<LiveSet>,
    counter: AtomicU64,
    spawn_permits: Semaphore,
    ring: Mutex<shardkv_ring::HashRing>,
    transport: Arc<dyn ReplicaTransport>,
    spawner: Arc<dyn ReplicaSpawner>,
    shard_table: Arc<ShardTable>,
    dead_tx: mpsc::UnboundedSender<NodeId>,
}

impl ReplicaManager {
    pub fn new(
        config: ManagerConfig,
        transport: Arc<dyn ReplicaTransport>,
        spawner: Arc<dyn ReplicaSpawner>,
        shard_table: Arc<ShardTable>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<NodeId>) {
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            spawn_permits: Semaphore::new(config.spawn_permits),
            config,
            live: Mutex::new(LiveSet {
                replicas: Vec::new(),
                fail_counts: HashMap::new(),
            }),
            counter: AtomicU64::new(0),
            ring: Mutex::new(shardkv_ring::HashRing::default()),
            transport,
            spawner,
            shard_table,
            dead_tx,
        });
        (manager, dead_rx)
    }

    pub fn next_replacement_name(&self) -> NodeId {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        NodeId::new(format!("ServerAuto{n}"))
    }

    /// Create (or replace) a worker and add it to the live set and ring.
    /// If `shards` is given, also configures the replica and merges it into
    /// each shard's replica list.
    pub async fn spawn(&self, name: &NodeId, shards: Option<&[ShardId]>) -> Result<(), String> {
        let _permit = self.spawn_permits.acquire().await.map_err(|e| e.to_string())?;

        let base_url = self.spawner.spawn(name).await.map_err(|e| e.to_string())?;
        register_if_http(&self.transport, name, &base_url);

        {
            let mut ring = self.ring.lock().await;
            ring.add(name.as_str()).map_err(|_| "ring full".to_string())?;
        }
        {
            let mut live = self.live.lock().await;
            if !live.replicas.contains(name) {
                live.replicas.push(name.clone());
            }
            live.fail_counts.insert(name.clone(), 0);
        }

        if let Some(shards) = shards {
            self.transport
                .config(name, shards)
                .await
                .map_err(|e| e.to_string())?;
            for shard in shards {
                self.shard_table.add_replica(shard, name.clone());
            }
        }
        info!(node = %name, "replica spawned");
        Ok(())
    }

    /// Stop and destroy a worker; remove it from the ring and from every
    /// shard's replica list.
    pub async fn remove(&self, name: &NodeId) -> Result<(), String> {
        let _permit = self.spawn_permits.acquire().await.map_err(|e| e.to_string())?;

        self.spawner.remove(name).await.map_err(|e| e.to_string())?;
        unregister_if_http(&self.transport, name);

        {
            let mut ring = self.ring.lock().await;
            ring.remove(name.as_str());
        }
        {
            let mut live = self.live.lock().await;
            live.replicas.retain(|r| r != name);
            live.fail_counts.remove(name);
        }
        self.shard_table.remove_replica_everywhere(name);
        info!(node = %name, "replica removed");
        Ok(())
    }

    pub async fn list(&self) -> Vec<NodeId> {
        self.live.lock().await.replicas.clone()
    }

    /// Pick up to `count` live replicas at random, excluding `exclude`.
    pub async fn random_replicas(&self, count: usize, exclude: &[NodeId]) -> Vec<NodeId> {
        use rand::seq::SliceRandom;
        let live = self.live.lock().await;
        let mut candidates: Vec<NodeId> = live
            .replicas
            .iter()
            .filter(|r| !exclude.contains(r))
            .cloned()
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(count);
        candidates
    }

    /// Run the heartbeat loop until `shutdown` resolves. Every
    /// `heartbeat_interval`, probes each live replica; on `max_fails`
    /// consecutive misses, reports it on the dead-replica channel and
    /// resets its count (the replica will be removed from the live set by
    /// whoever drains that channel, mirroring the source's sequential
    /// `on_server_dead` dispatch).
    pub async fn run_heartbeat_loop(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.heartbeat_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("heartbeat loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn heartbeat_once(&self) {
        let names = self.live.lock().await.replicas.clone();
        let mut dead = Vec::new();
        for name in names {
            let ok = self.transport.heartbeat(&name).await;
            let mut live = self.live.lock().await;
            let count = live.fail_counts.entry(name.clone()).or_insert(0);
            if ok {
                *count = 0;
            } else {
                *count += 1;
                if *count >= self.config.max_fails {
                    warn!(node = %name, "replica exceeded max_fails, marking dead");
                    *count = 0;
                    dead.push(name.clone());
                }
            }
        }
        // Sequential dispatch: send one at a time so the recovery driver
        // (which processes its channel in order) never handles two dead
        // replicas concurrently.
        for name in dead {
            let _ = self.dead_tx.send(name);
        }
    }
}

// `ReplicaTransport` doesn't know about addresses in general (the mock
// transport has none), so address registration is attempted via downcasting
// to the concrete HTTP transport rather than widening the trait with a
// method every implementation would have to no-op.
fn register_if_http(transport: &Arc<dyn ReplicaTransport>, node: &NodeId, base_url: &str) {
    if let Some(http) = transport
        .as_any()
        .downcast_ref::<crate::transport::HttpReplicaTransport>()
    {
        http.register_address(node.clone(), base_url.to_string());
    }
}

fn unregister_if_http(transport: &Arc<dyn ReplicaTransport>, node: &NodeId) {
    if let Some(http) = transport
        .as_any()
        .downcast_ref::<crate::transport::HttpReplicaTransport>()
    {
        http.unregister_address(node);
    }
}
