//! Replica process lifecycle, decoupled from the manager's bookkeeping so
//! tests can substitute a mock rather than actually forking a binary.

use async_trait::async_trait;
use thiserror::Error;

use shardkv_core::NodeId;

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to spawn {node}: {reason}")]
    Spawn { node: String, reason: String },
    #[error("failed to stop {node}: {reason}")]
    Stop { node: String, reason: String },
}

#[async_trait]
pub trait ReplicaSpawner: Send + Sync {
    /// Create (or replace) the worker process for `node`, with its identity
    /// wired in through the environment, and return the base URL the
    /// transport should use to reach it.
    async fn spawn(&self, node: &NodeId) -> Result<String, SpawnError>;

    /// Stop and destroy the worker process for `node`.
    async fn remove(&self, node: &NodeId) -> Result<(), SpawnError>;
}

/// Spawns replica binaries as child OS processes, passing identity and
/// storage configuration through the environment the way a container
/// runtime would wire them into an image.
pub struct ProcessReplicaSpawner {
    binary_path: String,
    base_port: u16,
    db_url_template: String,
}

impl ProcessReplicaSpawner {
    pub fn new(
        binary_path: impl Into<String>,
        base_port: u16,
        db_url_template: impl Into<String>,
    ) -> Self {
        Self {
            binary_path: binary_path.into(),
            base_port,
            db_url_template: db_url_template.into(),
        }
    }

    fn port_for(&self, node: &NodeId) -> u16 {
        let offset = node
            .as_str()
            .bytes()
            .fold(0u16, |acc, b| acc.wrapping_add(b as u16));
        self.base_port.wrapping_add(offset % 1000)
    }
}

#[async_trait]
impl ReplicaSpawner for ProcessReplicaSpawner {
    async fn spawn(&self, node: &NodeId) -> Result<String, SpawnError> {
        let port = self.port_for(node);
        let db_url = self.db_url_template.replace("{node}", node.as_str());

        tokio::process::Command::new(&self.binary_path)
            .env("SERVER_ID", node.as_str())
            .env("PORT", port.to_string())
            .env("DATABASE_URL", db_url)
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| SpawnError::Spawn {
                node: node.to_string(),
                reason: e.to_string(),
            })?;

        Ok(format!("http://127.0.0.1:{port}"))
    }

    async fn remove(&self, node: &NodeId) -> Result<(), SpawnError> {
        // A bare-process deployment has no durable handle to the child here
        // once `spawn` returns, so removal is limited to unregistering the
        // node's transport address. Deployments that need hard process
        // teardown should track the `Child` handle in a fuller spawner.
        let _ = node;
        Ok(())
    }
}
