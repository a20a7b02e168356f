//! Inter-node transport: the router's view of a replica's HTTP surface.
//!
//! `ReplicaTransport` is the seam the router and the recovery driver code
//! against. `HttpReplicaTransport` is the real `reqwest`-backed
//! implementation; `MockReplicaTransport` drives the integration tests
//! without opening a socket.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use shardkv_core::{NodeId, RowVersion, ShardId, StudentRow};
use shardkv_engine::{KeyRange, WriteRow};

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const COPY_TIMEOUT: Duration = Duration::from_secs(10);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("timed out calling {node}")]
    Timeout { node: String },
    #[error("{node} rejected the request: {reason}")]
    Rejected { node: String, reason: String },
    #[error("transport error talking to {node}: {reason}")]
    Transport { node: String, reason: String },
}

impl TransportError {
    pub fn node(&self) -> &str {
        match self {
            TransportError::Timeout { node }
            | TransportError::Rejected { node, .. }
            | TransportError::Transport { node, .. } => node,
        }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

#[async_trait]
pub trait ReplicaTransport: Send + Sync {
    /// Lets the manager register a freshly spawned replica's address with
    /// transports that need one (`HttpReplicaTransport`) while leaving
    /// address-less transports (the mock) a harmless no-op downcast target.
    fn as_any(&self) -> &dyn std::any::Any;

    async fn heartbeat(&self, node: &NodeId) -> bool;
    async fn config(&self, node: &NodeId, shards: &[ShardId]) -> TransportResult<()>;
    async fn write(
        &self,
        node: &NodeId,
        shard: &ShardId,
        valid_at: u64,
        rows: &[WriteRow],
        admin: bool,
    ) -> TransportResult<u64>;
    async fn read(
        &self,
        node: &NodeId,
        shard: &ShardId,
        valid_at: u64,
        range: KeyRange,
    ) -> TransportResult<Vec<StudentRow>>;
    async fn update(
        &self,
        node: &NodeId,
        shard: &ShardId,
        valid_at: u64,
        stud_id: i64,
        new_row: WriteRow,
    ) -> TransportResult<u64>;
    async fn delete(
        &self,
        node: &NodeId,
        shard: &ShardId,
        valid_at: u64,
        stud_id: i64,
    ) -> TransportResult<u64>;
    async fn copy(
        &self,
        node: &NodeId,
        shards: &[ShardId],
        valid_ats: &[u64],
    ) -> TransportResult<HashMap<ShardId, Vec<RowVersion>>>;
}

/// `reqwest`-backed transport. Addresses are registered by the replica
/// manager as it spawns/removes workers; a node with no registered address
/// is treated as unreachable rather than a panic, since the heartbeat loop
/// and recovery driver both need to keep running across partial failures.
pub struct HttpReplicaTransport {
    client: reqwest::Client,
    addresses: RwLock<HashMap<NodeId, String>>,
}

impl Default for HttpReplicaTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpReplicaTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            addresses: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_address(&self, node: NodeId, base_url: impl Into<String>) {
        self.addresses.write().unwrap().insert(node, base_url.into());
    }

    pub fn unregister_address(&self, node: &NodeId) {
        self.addresses.write().unwrap().remove(node);
    }

    fn base_url(&self, node: &NodeId) -> Option<String> {
        self.addresses.read().unwrap().get(node).cloned()
    }

    fn unreachable(&self, node: &NodeId) -> TransportError {
        TransportError::Transport {
            node: node.to_string(),
            reason: "no registered address".into(),
        }
    }

    async fn post<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        node: &NodeId,
        path: &str,
        body: &Req,
        timeout: Duration,
    ) -> TransportResult<Resp> {
        let base = self.base_url(node).ok_or_else(|| self.unreachable(node))?;
        let response = self
            .client
            .post(format!("{base}{path}"))
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| classify(node, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(TransportError::Rejected {
                node: node.to_string(),
                reason: format!("{status}: {text}"),
            });
        }
        response
            .json::<Resp>()
            .await
            .map_err(|e| TransportError::Transport {
                node: node.to_string(),
                reason: e.to_string(),
            })
    }
}

fn classify(node: &NodeId, err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout {
            node: node.to_string(),
        }
    } else {
        TransportError::Transport {
            node: node.to_string(),
            reason: err.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ConfigReq<'a> {
    shards: &'a [ShardId],
}

#[derive(Deserialize)]
struct StatusResp {}

#[derive(Serialize)]
struct WriteReq<'a> {
    shard: &'a ShardId,
    valid_at: u64,
    data: &'a [WriteRow],
    admin: bool,
}

#[derive(Deserialize)]
struct WriteResp {
    valid_at: u64,
}

#[derive(Serialize)]
struct ReadReq<'a> {
    shard: &'a ShardId,
    valid_at: u64,
    stud_id: KeyRange,
}

#[derive(Deserialize)]
struct ReadResp {
    data: Vec<StudentRow>,
}

#[derive(Serialize)]
struct UpdateReq<'a> {
    shard: &'a ShardId,
    valid_at: u64,
    stud_id: i64,
    data: WriteRow,
}

#[derive(Serialize)]
struct DeleteReq<'a> {
    shard: &'a ShardId,
    valid_at: u64,
    stud_id: i64,
}

#[derive(Serialize)]
struct CopyReq<'a> {
    shards: &'a [ShardId],
    valid_at: &'a [u64],
}

#[async_trait]
impl ReplicaTransport for HttpReplicaTransport {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn heartbeat(&self, node: &NodeId) -> bool {
        let Some(base) = self.base_url(node) else {
            return false;
        };
        self.client
            .get(format!("{base}/heartbeat"))
            .timeout(HEARTBEAT_TIMEOUT)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn config(&self, node: &NodeId, shards: &[ShardId]) -> TransportResult<()> {
        self.post::<_, StatusResp>(node, "/config", &ConfigReq { shards }, WRITE_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn write(
        &self,
        node: &NodeId,
        shard: &ShardId,
        valid_at: u64,
        rows: &[WriteRow],
        admin: bool,
    ) -> TransportResult<u64> {
        self.post::<_, WriteResp>(
            node,
            "/write",
            &WriteReq {
                shard,
                valid_at,
                data: rows,
                admin,
            },
            WRITE_TIMEOUT,
        )
        .await
        .map(|r| r.valid_at)
    }

    async fn read(
        &self,
        node: &NodeId,
        shard: &ShardId,
        valid_at: u64,
        range: KeyRange,
    ) -> TransportResult<Vec<StudentRow>> {
        self.post::<_, ReadResp>(
            node,
            "/read",
            &ReadReq {
                shard,
                valid_at,
                stud_id: range,
            },
            WRITE_TIMEOUT,
        )
        .await
        .map(|r| r.data)
    }

    async fn update(
        &self,
        node: &NodeId,
        shard: &ShardId,
        valid_at: u64,
        stud_id: i64,
        new_row: WriteRow,
    ) -> TransportResult<u64> {
        self.post::<_, WriteResp>(
            node,
            "/update",
            &UpdateReq {
                shard,
                valid_at,
                stud_id,
                data: new_row,
            },
            WRITE_TIMEOUT,
        )
        .await
        .map(|r| r.valid_at)
    }

    async fn delete(
        &self,
        node: &NodeId,
        shard: &ShardId,
        valid_at: u64,
        stud_id: i64,
    ) -> TransportResult<u64> {
        self.post::<_, WriteResp>(
            node,
            "/del",
            &DeleteReq {
                shard,
                valid_at,
                stud_id,
            },
            WRITE_TIMEOUT,
        )
        .await
        .map(|r| r.valid_at)
    }

    async fn copy(
        &self,
        node: &NodeId,
        shards: &[ShardId],
        valid_ats: &[u64],
    ) -> TransportResult<HashMap<ShardId, Vec<RowVersion>>> {
        self.post(
            node,
            "/copy",
            &CopyReq {
                shards,
                valid_at: valid_ats,
            },
            COPY_TIMEOUT,
        )
        .await
    }
}
