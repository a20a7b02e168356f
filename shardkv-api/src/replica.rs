//! Replica-side HTTP surface: `/home`, `/heartbeat`, `/config`, `/write`,
//! `/read`, `/update`, `/del`, `/copy`.
//! Thin JSON wrapper around a `shardkv_engine::ShardStore`; all reconciliation
//! semantics live in that crate, not here.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use shardkv_core::{NodeId, RowVersion, ShardId, StudentRow};
use shardkv_engine::{KeyRange, ShardStore, WriteRow};

use crate::error::ApiError;

#[derive(Clone)]
pub struct ReplicaState {
    store: Arc<dyn ShardStore>,
    server_id: NodeId,
}

impl ReplicaState {
    pub fn new(server_id: NodeId, store: Arc<dyn ShardStore>) -> Self {
        Self { store, server_id }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConfigRequest {
    pub shards: Vec<ShardId>,
}

#[derive(Debug, Deserialize)]
pub struct WriteRequest {
    pub shard: ShardId,
    pub valid_at: u64,
    pub data: Vec<WriteRow>,
    #[serde(default)]
    pub admin: bool,
}

#[derive(Debug, Serialize)]
pub struct WriteResponse {
    pub valid_at: u64,
}

#[derive(Debug, Deserialize)]
pub struct ReadRequest {
    pub shard: ShardId,
    pub valid_at: u64,
    pub stud_id: KeyRange,
}

#[derive(Debug, Serialize)]
pub struct ReadResponse {
    pub data: Vec<StudentRow>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    pub shard: ShardId,
    pub valid_at: u64,
    pub stud_id: i64,
    pub data: WriteRow,
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub shard: ShardId,
    pub valid_at: u64,
    pub stud_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct CopyRequest {
    pub shards: Vec<ShardId>,
    pub valid_at: Vec<u64>,
}

pub fn build_replica_router(state: ReplicaState) -> Router {
    Router::new()
        .route("/home", get(home))
        .route("/heartbeat", get(heartbeat))
        .route("/config", post(config))
        .route("/write", post(write))
        .route("/read", post(read))
        .route("/update", post(update))
        .route("/del", post(del))
        .route("/copy", post(copy))
        .with_state(state)
}

async fn home(State(state): State<ReplicaState>) -> impl IntoResponse {
    Json(serde_json::json!({ "server": state.server_id.as_str() }))
}

async fn heartbeat() -> StatusCode {
    StatusCode::OK
}

async fn config(State(state): State<ReplicaState>, Json(req): Json<ConfigRequest>) -> Result<StatusCode, ApiError> {
    state.store.configure(&req.shards).await?;
    Ok(StatusCode::OK)
}

async fn write(State(state): State<ReplicaState>, Json(req): Json<WriteRequest>) -> Result<Json<WriteResponse>, ApiError> {
    let valid_at = state.store.write(&req.shard, req.valid_at, &req.data, req.admin).await?;
    Ok(Json(WriteResponse { valid_at }))
}

async fn read(State(state): State<ReplicaState>, Json(req): Json<ReadRequest>) -> Result<Json<ReadResponse>, ApiError> {
    let data = state.store.read(&req.shard, req.valid_at, req.stud_id).await?;
    Ok(Json(ReadResponse { data }))
}

async fn update(State(state): State<ReplicaState>, Json(req): Json<UpdateRequest>) -> Result<Json<WriteResponse>, ApiError> {
    let valid_at = state.store.update(&req.shard, req.valid_at, req.stud_id, req.data).await?;
    Ok(Json(WriteResponse { valid_at }))
}

async fn del(State(state): State<ReplicaState>, Json(req): Json<DeleteRequest>) -> Result<Json<WriteResponse>, ApiError> {
    let valid_at = state.store.delete(&req.shard, req.valid_at, req.stud_id).await?;
    Ok(Json(WriteResponse { valid_at }))
}

async fn copy(State(state): State<ReplicaState>, Json(req): Json<CopyRequest>) -> Result<Json<HashMap<ShardId, Vec<RowVersion>>>, ApiError> {
    let snapshot = state.store.copy(&req.shards, &req.valid_at).await?;
    Ok(Json(snapshot))
}
