//! Recovery driver (C5): invoked once per dead replica reported by the
//! manager's heartbeat loop. Drains the dead-replica channel sequentially so
//! recovery for one replica always completes before the next begins, the
//! same ordering guarantee the heartbeat loop itself provides.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use shardkv_core::{NodeId, ShardId};
use shardkv_engine::WriteRow;

use crate::manager::ReplicaManager;
use crate::router::{HEARTBEAT_WAIT_DELAY, HEARTBEAT_WAIT_RETRIES};
use crate::shard_table::ShardTable;
use crate::transport::ReplicaTransport;

pub struct RecoveryDriver {
    table: Arc<ShardTable>,
    manager: Arc<ReplicaManager>,
    transport: Arc<dyn ReplicaTransport>,
}

impl RecoveryDriver {
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

    /// Drain `dead_rx` until the channel is closed (i.e. the manager, and
    /// with it the heartbeat loop, has shut down).
    pub async fn run(self: Arc<Self>, mut dead_rx: mpsc::UnboundedReceiver<NodeId>) {
        while let Some(dead) = dead_rx.recv().await {
            self.recover(&dead).await;
        }
        info!("recovery driver shutting down: dead-replica channel closed");
    }

    async fn recover(&self, dead: &NodeId) {
        info!(node = %dead, "recovery: handling failure");

        // Snapshot before removing the dead server from the table.
        let affected = self.table.shards_held_by(dead);
        self.table.remove_replica_everywhere(dead);
        if let Err(reason) = self.manager.remove(dead).await {
            warn!(node = %dead, %reason, "recovery: failed to remove dead replica cleanly");
        }

        if affected.is_empty() {
            info!(node = %dead, "recovery: no shards were mapped to this replica");
            return;
        }

        let replacement = self.manager.next_replacement_name();
        if let Err(reason) = self.manager.spawn(&replacement, None).await {
            warn!(node = %replacement, %reason, "recovery: failed to spawn replacement");
            return;
        }

        if !self.wait_for_heartbeat(&replacement).await {
            warn!(node = %replacement, "recovery: replacement never answered heartbeat, aborting");
            return;
        }

        if let Err(err) = self.transport.config(&replacement, &affected).await {
            warn!(node = %replacement, %err, "recovery: /config failed, aborting");
            return;
        }

        for shard_id in &affected {
            self.restore_shard(shard_id, &replacement).await;
            self.table.add_replica(shard_id, replacement.clone());
        }

        info!(node = %replacement, shards = affected.len(), "recovery: replacement online");
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

    /// Copy `shard_id` from any surviving replica at the shard's current
    /// `valid_at`, then replay each surviving row version onto `replacement`
    /// as an admin-mode write so the donor's term numbering is preserved.
    async fn restore_shard(&self, shard_id: &ShardId, replacement: &NodeId) {
        let Some(view) = self.table.view(shard_id) else {
            return;
        };
        let Some(donor) = view.replicas.iter().find(|r| *r != replacement).cloned() else {
            warn!(shard = %shard_id, "recovery: no surviving replica to copy from");
            return;
        };

        let valid_at = view.valid_at;
        let snapshot = match self
            .transport
            .copy(&donor, std::slice::from_ref(shard_id), std::slice::from_ref(&valid_at))
            .await
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(shard = %shard_id, %donor, %err, "recovery: copy from donor failed");
                return;
            }
        };

        let Some(rows) = snapshot.get(shard_id) else {
            return;
        };
        let mut restored = 0usize;
        for row in rows {
            let write_row = WriteRow {
                stud_id: row.stud_id,
                stud_name: row.stud_name.clone(),
                stud_marks: row.stud_marks,
            };
            match self
                .transport
                .write(replacement, shard_id, row.created_at, std::slice::from_ref(&write_row), true)
                .await
            {
                Ok(_) => restored += 1,
                Err(err) => warn!(shard = %shard_id, %err, "recovery: admin write to replacement failed"),
            }
        }
        info!(shard = %shard_id, rows = restored, %donor, "recovery: shard restored");
    }
}
