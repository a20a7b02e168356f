use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use shardkv_api::{build_replica_router, ReplicaState};
use shardkv_core::NodeId;
use shardkv_engine::{InMemoryShardStore, ShardStore};

#[derive(Parser, Debug)]
#[command(name = "shardkv-replica", about = "Replica-side shard engine process")]
struct Cli {
    /// HTTP listening address
    #[arg(long, env = "PORT", default_value = "0.0.0.0:9000")]
    addr: SocketAddr,

    /// This replica's identity, as registered with the coordinator
    #[arg(long, env = "SERVER_ID")]
    server_id: String,

    /// Storage backend: `memory` (default) or, with the `sqlite` feature, `sqlite:<path>`
    #[arg(long, env = "DATABASE_URL", default_value = "memory")]
    database_url: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    shardkv_api::init_tracing();

    let cli = Cli::parse();
    let server_id = NodeId::new(cli.server_id.clone());
    info!(server = %server_id, backend = %cli.database_url, "starting shardkv replica");

    let store: Arc<dyn ShardStore> = build_store(&cli.database_url).await?;
    let state = ReplicaState::new(server_id, store);
    let app = build_replica_router(state).layer(tower_http::trace::TraceLayer::new_for_http());

    let listener = TcpListener::bind(cli.addr).await?;
    info!("shardkv replica listening on {}", cli.addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("shardkv replica stopped");
    Ok(())
}

#[cfg(feature = "sqlite")]
async fn build_store(database_url: &str) -> anyhow::Result<Arc<dyn ShardStore>> {
    if let Some(path) = database_url.strip_prefix("sqlite:") {
        let store = shardkv_engine::sqlite::SqliteShardStore::connect(path).await?;
        Ok(Arc::new(store))
    } else {
        Ok(Arc::new(InMemoryShardStore::new()))
    }
}

#[cfg(not(feature = "sqlite"))]
async fn build_store(_database_url: &str) -> anyhow::Result<Arc<dyn ShardStore>> {
    Ok(Arc::new(InMemoryShardStore::new()))
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C signal handler");
    info!("shutdown signal received");
}
