//! End-to-end scenarios driving `Coordinator` against the in-process mock
//! transport/spawner pair: no HTTP, no real processes, but the full shard
//! table + replica manager + router + recovery driver wired together
//! exactly as `shardkv-api` wires them in production.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use shardkv_core::{NodeId, ShardId, ShardSpec};
use shardkv_engine::WriteRow;

use crate::testing::{MockReplicaSpawner, MockReplicaTransport};
use crate::{Coordinator, CoordinatorConfig};

fn row(stud_id: i64, name: &str, marks: i64) -> WriteRow {
    WriteRow {
        stud_id,
        stud_name: name.to_string(),
        stud_marks: marks,
    }
}

fn three_shard_layout() -> (Vec<ShardSpec>, HashMap<String, Vec<ShardId>>) {
    let shards = vec![
        ShardSpec {
            shard_id: ShardId::new("sh1"),
            stud_id_low: 0,
            shard_size: 1000,
        },
        ShardSpec {
            shard_id: ShardId::new("sh2"),
            stud_id_low: 1000,
            shard_size: 1000,
        },
        ShardSpec {
            shard_id: ShardId::new("sh3"),
            stud_id_low: 2000,
            shard_size: 1000,
        },
    ];
    let all_shards: Vec<ShardId> = shards.iter().map(|s| s.shard_id.clone()).collect();
    let mut servers = HashMap::new();
    servers.insert("s1".to_string(), all_shards.clone());
    servers.insert("s2".to_string(), all_shards);
    (shards, servers)
}

fn new_coordinator(config: CoordinatorConfig) -> (Coordinator, Arc<MockReplicaTransport>) {
    let transport = Arc::new(MockReplicaTransport::new());
    let spawner = Arc::new(MockReplicaSpawner::new(transport.clone()));
    let coordinator = Coordinator::start(config, transport.clone(), spawner);
    (coordinator, transport)
}

/// Scenario 1: init 3 shards / 2 servers each covering all 3, write one row,
/// read a range that only covers sh1.
#[tokio::test]
async fn scenario_init_write_then_ranged_read() {
    let (coordinator, _transport) = new_coordinator(CoordinatorConfig::default());
    let (shards, servers) = three_shard_layout();
    coordinator.router.init(shards, servers).await;

    coordinator
        .router
        .write(vec![row(42, "A", 7)])
        .await
        .unwrap();

    let (shards_queried, rows) = coordinator.router.read(0, 100).await;
    assert_eq!(shards_queried, vec![ShardId::new("sh1")]);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].stud_id, 42);
}

/// Scenario 2: 100 concurrent writes to the same stud_id. The shard's
/// valid_at ends up exactly 100. `write` inserts a new version per call
/// without tombstoning any earlier one (only `update`/`delete` do that), so
/// all 100 versions are still live at that horizon.
#[tokio::test]
async fn scenario_concurrent_writes_advance_valid_at_monotonically() {
    let (coordinator, _transport) = new_coordinator(CoordinatorConfig::default());
    let (shards, servers) = three_shard_layout();
    coordinator.router.init(shards, servers).await;

    let coordinator = Arc::new(coordinator);
    let mut handles = Vec::new();
    for i in 0..100i64 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            coordinator
                .router
                .write(vec![row(500, &format!("v{i}"), i)])
                .await
                .unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let view = coordinator.router.table().view(&ShardId::new("sh1")).unwrap();
    assert_eq!(view.valid_at, 100);

    let (_, rows) = coordinator.router.read(0, 1000).await;
    let live: Vec<_> = rows.iter().filter(|r| r.stud_id == 500).collect();
    assert_eq!(live.len(), 100);
}

/// Scenario 3: 1 shard, 3 replicas; kill one (heartbeat always fails), the
/// manager's heartbeat loop detects it, recovery spawns a replacement and
/// restores the shard's data onto it.
#[tokio::test]
async fn scenario_recovery_converges_after_replica_death() {
    let config = CoordinatorConfig {
        heartbeat_interval: Duration::from_millis(15),
        max_fails: 2,
        spawn_permits: 5,
    };
    let (coordinator, transport) = new_coordinator(config);

    let shards = vec![ShardSpec {
        shard_id: ShardId::new("sh1"),
        stud_id_low: 0,
        shard_size: 1000,
    }];
    let mut servers = HashMap::new();
    for name in ["s1", "s2", "s3"] {
        servers.insert(name.to_string(), vec![ShardId::new("sh1")]);
    }
    coordinator.router.init(shards, servers).await;

    coordinator
        .router
        .write(vec![row(1, "a", 1), row(2, "b", 2)])
        .await
        .unwrap();

    transport.set_alive(&NodeId::new("s1"), false);

    let mut recovered = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if let Some(view) = coordinator.router.table().view(&ShardId::new("sh1")) {
            let has_dead = view.replicas.iter().any(|r| r.as_str() == "s1");
            if !has_dead && view.replicas.len() == 3 {
                recovered = true;
                break;
            }
        }
    }
    assert!(recovered, "recovery never replaced the dead replica");

    let (_, rows) = coordinator.router.read(0, 1000).await;
    assert_eq!(rows.len(), 2, "replacement should hold the full pre-kill dataset");

    coordinator.shutdown();
}

/// Scenario 5: `/rm` with n=2, hostnames=["S1"] against 4 live replicas
/// removes S1 plus exactly one additional, randomly chosen, replica.
#[tokio::test]
async fn scenario_rm_removes_named_plus_random_remainder() {
    let (coordinator, _transport) = new_coordinator(CoordinatorConfig::default());
    coordinator
        .router
        .add(4, vec!["S1".into(), "S2".into(), "S3".into(), "S4".into()])
        .await
        .unwrap();
    assert_eq!(coordinator.router.replicas().await.len(), 4);

    let remaining = coordinator
        .router
        .remove(2, vec!["S1".into()])
        .await
        .unwrap();

    assert_eq!(remaining.len(), 2);
    assert!(!remaining.contains(&NodeId::new("S1")));
}

/// Scenario 6: a read spanning [500, 2500] over the 3-shard layout touches
/// every shard whose interval intersects the range.
#[tokio::test]
async fn scenario_read_reports_every_intersecting_shard() {
    let (coordinator, _transport) = new_coordinator(CoordinatorConfig::default());
    let (shards, servers) = three_shard_layout();
    coordinator.router.init(shards, servers).await;

    let (shards_queried, _rows) = coordinator.router.read(500, 2500).await;
    assert_eq!(
        shards_queried,
        vec![ShardId::new("sh1"), ShardId::new("sh2"), ShardId::new("sh3")]
    );
}

/// Mutations on different stud_ids in the same shard still each advance
/// valid_at by exactly one, strictly increasing across the sequence.
#[tokio::test]
async fn valid_at_is_strictly_increasing_across_mixed_mutations() {
    let (coordinator, _transport) = new_coordinator(CoordinatorConfig::default());
    let (shards, servers) = three_shard_layout();
    coordinator.router.init(shards, servers).await;

    let mut seen = Vec::new();
    coordinator.router.write(vec![row(10, "a", 1)]).await.unwrap();
    seen.push(coordinator.router.table().view(&ShardId::new("sh1")).unwrap().valid_at);
    let (vat, _) = coordinator.router.update(10, row(10, "b", 2)).await.unwrap();
    seen.push(vat);
    let (vat, _) = coordinator.router.delete(10).await.unwrap();
    seen.push(vat);

    for window in seen.windows(2) {
        assert!(window[1] > window[0], "valid_at must strictly increase: {seen:?}");
    }
}
