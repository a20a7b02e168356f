use shardkv_core::ShardId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("stud_id {0} falls in no configured shard")]
    OutOfRange(i64),

    #[error("shard {0} has no live replicas")]
    NoReplicas(ShardId),

    #[error("shard {0} is not present in the shard table")]
    UnknownShard(ShardId),

    #[error("hostnames list longer than n ({got} > {n})")]
    TooManyHostnames { got: usize, n: usize },

    #[error("hash ring is full")]
    RingFull,

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("failed to read cluster config: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("failed to parse cluster config: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

/// A single replica's failure to complete a fanned-out operation. Never
/// raised across the router's own request boundary: always collected into a
/// response's `failures` field instead, per the propagation policy that
/// transport/replica errors are structured data, not exceptions.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReplicaFailure {
    pub node: String,
    pub reason: String,
}

impl ReplicaFailure {
    pub fn new(node: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self {
            node: node.into(),
            reason: reason.to_string(),
        }
    }
}
