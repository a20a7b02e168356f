//! The HTTP surface for both coordinator and replica processes, plus the CLI
//! entry points (`shardkv-coordinator`, `shardkv-replica`) and shared
//! tracing initialization: one crate, one `AppState`-per-role, `ApiError`
//! mapped through `IntoResponse`.

pub mod coordinator;
pub mod error;
pub mod replica;

pub use coordinator::{build_coordinator_router, CoordinatorState};
pub use error::ApiError;
pub use replica::{build_replica_router, ReplicaState};

/// `tracing` + `EnvFilter` init shared by both binaries.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,shardkv_api=debug,shardkv_cluster=debug"));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();
}
