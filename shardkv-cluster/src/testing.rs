//! Mock collaborators for deterministic tests: an in-memory transport that
//! talks to in-process `shardkv_engine` stores instead of real sockets, and
//! a spawner that just records calls. Exposed behind `test-support` so
//! `shardkv-api`'s integration tests can reuse them without duplicating the
//! plumbing.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use shardkv_core::{NodeId, RowVersion, ShardId, StudentRow};
use shardkv_engine::{EngineError, InMemoryShardStore, KeyRange, ShardStore, WriteRow};

use crate::spawner::{ReplicaSpawner, SpawnError};
use crate::transport::{ReplicaTransport, TransportError, TransportResult};

/// An in-memory replica: a real `ShardStore` plus a liveness flag the test
/// can flip to simulate a dead heartbeat without touching the network.
pub struct MockReplica {
    pub store: InMemoryShardStore,
    pub alive: std::sync::atomic::AtomicBool,
}

impl Default for MockReplica {
    fn default() -> Self {
        Self {
            store: InMemoryShardStore::new(),
            alive: std::sync::atomic::AtomicBool::new(true),
        }
    }
}

#[derive(Default)]
pub struct MockReplicaTransport {
    replicas: Mutex<HashMap<NodeId, std::sync::Arc<MockReplica>>>,
}

impl MockReplicaTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: NodeId, replica: std::sync::Arc<MockReplica>) {
        self.replicas.lock().unwrap().insert(node, replica);
    }

    pub fn set_alive(&self, node: &NodeId, alive: bool) {
        if let Some(replica) = self.replicas.lock().unwrap().get(node) {
            replica
                .alive
                .store(alive, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn get(&self, node: &NodeId) -> TransportResult<std::sync::Arc<MockReplica>> {
        self.replicas
            .lock()
            .unwrap()
            .get(node)
            .cloned()
            .ok_or_else(|| TransportError::Transport {
                node: node.to_string(),
                reason: "no such mock replica".into(),
            })
    }

    fn engine_err(node: &NodeId, err: EngineError) -> TransportError {
        match err {
            EngineError::ShardNotOwned(shard) => TransportError::Rejected {
                node: node.to_string(),
                reason: format!("shard {shard} not owned"),
            },
            EngineError::Backend(reason) => TransportError::Transport {
                node: node.to_string(),
                reason,
            },
        }
    }
}

#[async_trait]
impl ReplicaTransport for MockReplicaTransport {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn heartbeat(&self, node: &NodeId) -> bool {
        match self.get(node) {
            Ok(replica) => replica.alive.load(std::sync::atomic::Ordering::SeqCst),
            Err(_) => false,
        }
    }

    async fn config(&self, node: &NodeId, shards: &[ShardId]) -> TransportResult<()> {
        let replica = self.get(node)?;
        replica
            .store
            .configure(shards)
            .await
            .map_err(|e| Self::engine_err(node, e))
    }

    async fn write(
        &self,
        node: &NodeId,
        shard: &ShardId,
        valid_at: u64,
        rows: &[WriteRow],
        admin: bool,
    ) -> TransportResult<u64> {
        let replica = self.get(node)?;
        if !replica.alive.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(TransportError::Timeout {
                node: node.to_string(),
            });
        }
        replica
            .store
            .write(shard, valid_at, rows, admin)
            .await
            .map_err(|e| Self::engine_err(node, e))
    }

    async fn read(
        &self,
        node: &NodeId,
        shard: &ShardId,
        valid_at: u64,
        range: KeyRange,
    ) -> TransportResult<Vec<StudentRow>> {
        let replica = self.get(node)?;
        if !replica.alive.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(TransportError::Timeout {
                node: node.to_string(),
            });
        }
        replica
            .store
            .read(shard, valid_at, range)
            .await
            .map_err(|e| Self::engine_err(node, e))
    }

    async fn update(
        &self,
        node: &NodeId,
        shard: &ShardId,
        valid_at: u64,
        stud_id: i64,
        new_row: WriteRow,
    ) -> TransportResult<u64> {
        let replica = self.get(node)?;
        replica
            .store
            .update(shard, valid_at, stud_id, new_row)
            .await
            .map_err(|e| Self::engine_err(node, e))
    }

    async fn delete(
        &self,
        node: &NodeId,
        shard: &ShardId,
        valid_at: u64,
        stud_id: i64,
    ) -> TransportResult<u64> {
        let replica = self.get(node)?;
        replica
            .store
            .delete(shard, valid_at, stud_id)
            .await
            .map_err(|e| Self::engine_err(node, e))
    }

    async fn copy(
        &self,
        node: &NodeId,
        shards: &[ShardId],
        valid_ats: &[u64],
    ) -> TransportResult<HashMap<ShardId, Vec<RowVersion>>> {
        let replica = self.get(node)?;
        replica
            .store
            .copy(shards, valid_ats)
            .await
            .map_err(|e| Self::engine_err(node, e))
    }
}

/// Spawner that just allocates fresh in-memory replicas and registers them
/// with a paired `MockReplicaTransport`, so recovery and init tests never
/// touch a real process.
pub struct MockReplicaSpawner {
    transport: std::sync::Arc<MockReplicaTransport>,
}

impl MockReplicaSpawner {
    pub fn new(transport: std::sync::Arc<MockReplicaTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl ReplicaSpawner for MockReplicaSpawner {
    async fn spawn(&self, node: &NodeId) -> Result<String, SpawnError> {
        self.transport
            .register(node.clone(), std::sync::Arc::new(MockReplica::default()));
        Ok(format!("mock://{node}"))
    }

    async fn remove(&self, node: &NodeId) -> Result<(), SpawnError> {
        self.transport.replicas.lock().unwrap().remove(node);
        Ok(())
    }
}
