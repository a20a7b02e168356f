use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::net::TcpListener;
use tracing::info;

use shardkv_api::coordinator::build_coordinator_router;
use shardkv_api::CoordinatorState;
use shardkv_cluster::{CoordinatorConfig, HttpReplicaTransport, ProcessReplicaSpawner};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Replicated,
    Stateless,
}

#[derive(Parser, Debug)]
#[command(name = "shardkv-coordinator", about = "Shard router / replication coordinator")]
struct Cli {
    /// HTTP listening address
    #[arg(long, env = "SHARDKV_ADDR", default_value = "0.0.0.0:8080")]
    addr: SocketAddr,

    /// Routing mode: a full replicated shard table, or a stateless ring
    #[arg(long, env = "SHARDKV_MODE", value_enum, default_value = "replicated")]
    mode: Mode,

    /// Path to a JSON file with heartbeat_interval_secs/max_fails/spawn_permits;
    /// falls back to `SHARDKV_CLUSTER_CONFIG`, then to the individual flags below
    #[arg(long, env = "SHARDKV_CLUSTER_CONFIG_PATH")]
    cluster_config: Option<PathBuf>,

    /// Path to the replica server binary this coordinator spawns
    #[arg(long, env = "SHARDKV_REPLICA_BIN", default_value = "shardkv-replica")]
    replica_bin: String,

    /// First port handed to spawned replicas; each gets a deterministic offset from its name
    #[arg(long, env = "SHARDKV_REPLICA_BASE_PORT", default_value_t = 9000)]
    replica_base_port: u16,

    /// `DATABASE_URL` template passed to spawned replicas; `{node}` is replaced with the server id
    #[arg(long, env = "SHARDKV_REPLICA_DB_URL", default_value = "memory")]
    replica_db_url: String,

    /// Heartbeat interval in seconds (replicated mode only)
    #[arg(long, env = "SHARDKV_HEARTBEAT_SECS", default_value_t = 5)]
    heartbeat_secs: u64,

    /// Consecutive heartbeat misses before a replica is declared dead
    #[arg(long, env = "SHARDKV_MAX_FAILS", default_value_t = 3)]
    max_fails: u32,

    /// Concurrent spawn/remove operations allowed at once
    #[arg(long, env = "SHARDKV_SPAWN_PERMITS", default_value_t = 5)]
    spawn_permits: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    shardkv_api::init_tracing();

    let cli = Cli::parse();
    info!(mode = ?cli.mode, addr = %cli.addr, "starting shardkv coordinator");

    let transport: Arc<shardkv_cluster::HttpReplicaTransport> = Arc::new(HttpReplicaTransport::new());
    let spawner = Arc::new(ProcessReplicaSpawner::new(
        cli.replica_bin.clone(),
        cli.replica_base_port,
        cli.replica_db_url.clone(),
    ));

    let state = match cli.mode {
        Mode::Replicated => {
            let config = if let Some(path) = cli.cluster_config {
                CoordinatorConfig::from_path(path).expect("failed to load cluster config")
            } else if std::env::var_os("SHARDKV_CLUSTER_CONFIG").is_some() {
                CoordinatorConfig::from_env_or_default().expect("failed to load cluster config")
            } else {
                CoordinatorConfig {
                    heartbeat_interval: Duration::from_secs(cli.heartbeat_secs),
                    max_fails: cli.max_fails,
                    spawn_permits: cli.spawn_permits,
                }
            };
            CoordinatorState::replicated(config, transport, spawner)
        }
        Mode::Stateless => CoordinatorState::stateless(transport, spawner),
    };

    let app = build_coordinator_router(state).layer(tower_http::trace::TraceLayer::new_for_http());

    let listener = TcpListener::bind(cli.addr).await?;
    info!("shardkv coordinator listening on {}", cli.addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("shardkv coordinator stopped");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C signal handler");
    info!("shutdown signal received");
}
