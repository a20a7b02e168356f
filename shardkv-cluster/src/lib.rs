//! Distributed control plane: the shard table, replica manager, shard
//! router/replication coordinator, and recovery driver (C3/C4/C5), plus the
//! `ReplicaTransport`/`ReplicaSpawner` contracts for the two external
//! collaborators named in the system's scope (the inter-node transport and
//! the process/container runtime). `shardkv-api` wires these together
//! behind its HTTP surface; `testing` gives it (and this crate's own tests)
//! in-process substitutes for both.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use shardkv_core::NodeId;

pub mod error;
pub mod manager;
pub mod recovery;
pub mod router;
pub mod shard_table;
pub mod spawner;
pub mod stateless;
pub mod transport;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

#[cfg(test)]
mod integration_tests;

pub use error::{ClusterError, ReplicaFailure};
pub use manager::{ManagerConfig, ReplicaManager};
pub use recovery::RecoveryDriver;
pub use router::{ShardRouter, ShardWriteResult};
pub use shard_table::{ShardTable, ShardView};
pub use spawner::{ProcessReplicaSpawner, ReplicaSpawner, SpawnError};
pub use stateless::StatelessRouter;
pub use transport::{HttpReplicaTransport, ReplicaTransport, TransportError};

/// Heartbeat cadence, failure threshold, and the spawn/remove concurrency
/// limit. Ring geometry (`total_slots`/`K`) lives on `shardkv_ring::HashRing`
/// itself and isn't duplicated here.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub heartbeat_interval: Duration,
    pub max_fails: u32,
    pub spawn_permits: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            max_fails: 3,
            spawn_permits: 5,
        }
    }
}

/// `Duration` has no native serde impl, so the on-disk shape stores the
/// heartbeat interval in seconds and converts on load/save.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CoordinatorConfigFile {
    #[serde(default = "default_heartbeat_secs")]
    heartbeat_interval_secs: u64,
    #[serde(default = "default_max_fails")]
    max_fails: u32,
    #[serde(default = "default_spawn_permits")]
    spawn_permits: usize,
}

fn default_heartbeat_secs() -> u64 {
    5
}

fn default_max_fails() -> u32 {
    3
}

fn default_spawn_permits() -> usize {
    5
}

impl From<CoordinatorConfigFile> for CoordinatorConfig {
    fn from(file: CoordinatorConfigFile) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(file.heartbeat_interval_secs),
            max_fails: file.max_fails,
            spawn_permits: file.spawn_permits,
        }
    }
}

impl From<&CoordinatorConfig> for CoordinatorConfigFile {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            heartbeat_interval_secs: config.heartbeat_interval.as_secs(),
            max_fails: config.max_fails,
            spawn_permits: config.spawn_permits,
        }
    }
}

impl CoordinatorConfig {
    /// Load the heartbeat/recovery tunables from a JSON config file, the
    /// same shape `to_path` writes.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ClusterError> {
        let content = std::fs::read_to_string(path)?;
        let file: CoordinatorConfigFile = serde_json::from_str(&content)?;
        Ok(file.into())
    }

    pub fn to_path(&self, path: impl AsRef<Path>) -> Result<(), ClusterError> {
        let file: CoordinatorConfigFile = self.into();
        let content = serde_json::to_string_pretty(&file)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Read `SHARDKV_CLUSTER_CONFIG` for a config file path, falling back to
    /// `Default` (spec.md's tunable defaults) when unset — the coordinator
    /// binary's `--cluster-config` flag feeds this same path in.
    pub fn from_env_or_default() -> Result<Self, ClusterError> {
        match std::env::var("SHARDKV_CLUSTER_CONFIG") {
            Ok(path) => Self::from_path(path),
            Err(_) => Ok(Self::default()),
        }
    }
}

/// Everything a coordinator process needs: the shard router clients drive
/// over HTTP, plus the manager/recovery pair running in the background.
/// Packaged so `shardkv-api` only has to call `Coordinator::start`.
pub struct Coordinator {
    pub router: ShardRouter,
    manager: Arc<ReplicaManager>,
    heartbeat_shutdown: watch::Sender<bool>,
}

impl Coordinator {
    /// Wire the shard table, manager, router, and recovery driver together
    /// and spawn the heartbeat loop and the recovery driver as background
    /// tasks. Returns the `Coordinator` handle; call `shutdown` to cancel
    /// both tasks cleanly.
    pub fn start(
        config: CoordinatorConfig,
        transport: Arc<dyn ReplicaTransport>,
        spawner: Arc<dyn ReplicaSpawner>,
    ) -> Self {
        let table = Arc::new(ShardTable::new());
        let manager_config = ManagerConfig {
            heartbeat_interval: config.heartbeat_interval,
            max_fails: config.max_fails,
            spawn_permits: config.spawn_permits,
        };
        let (manager, dead_rx): (Arc<ReplicaManager>, mpsc::UnboundedReceiver<NodeId>) =
            ReplicaManager::new(manager_config, transport.clone(), spawner, table.clone());

        let recovery = Arc::new(RecoveryDriver::new(table.clone(), manager.clone(), transport.clone()));
        tokio::spawn(recovery.run(dead_rx));

        let (heartbeat_shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(manager.clone().run_heartbeat_loop(shutdown_rx));

        let router = ShardRouter::new(table, manager.clone(), transport);

        Self {
            router,
            manager,
            heartbeat_shutdown,
        }
    }

    pub async fn replicas(&self) -> Vec<NodeId> {
        self.manager.list().await
    }

    /// Cancel the heartbeat loop. Pending probes are abandoned; the recovery
    /// driver exits once its channel is dropped alongside the manager.
    pub fn shutdown(&self) {
        let _ = self.heartbeat_shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trip_to_disk() {
        let cfg = CoordinatorConfig {
            heartbeat_interval: Duration::from_secs(9),
            max_fails: 4,
            spawn_permits: 2,
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.json");
        cfg.to_path(&path).unwrap();
        let loaded = CoordinatorConfig::from_path(&path).unwrap();
        assert_eq!(loaded.heartbeat_interval, cfg.heartbeat_interval);
        assert_eq!(loaded.max_fails, cfg.max_fails);
        assert_eq!(loaded.spawn_permits, cfg.spawn_permits);
    }

    #[test]
    fn missing_env_var_falls_back_to_default() {
        std::env::remove_var("SHARDKV_CLUSTER_CONFIG");
        let cfg = CoordinatorConfig::from_env_or_default().unwrap();
        assert_eq!(cfg.max_fails, CoordinatorConfig::default().max_fails);
    }
}
