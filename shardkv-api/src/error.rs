//! The HTTP error surface shared by the coordinator and replica routers.
//!
//! Propagation policy: only malformed input and `OutOfRange` produce 4xx; a
//! shard with no live replicas or a ring at capacity are server-side
//! conditions and produce 5xx. Transport/replica failures from a fan-out
//! never reach this type at all — they're folded into a response's
//! `failures`/`details` field by the caller instead.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use shardkv_cluster::ClusterError;
use shardkv_engine::EngineError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Cluster(ClusterError::OutOfRange(_)) => StatusCode::BAD_REQUEST,
            ApiError::Cluster(ClusterError::UnknownShard(_)) => StatusCode::BAD_REQUEST,
            ApiError::Cluster(ClusterError::TooManyHostnames { .. }) => StatusCode::BAD_REQUEST,
            ApiError::Cluster(ClusterError::Malformed(_)) => StatusCode::BAD_REQUEST,
            ApiError::Cluster(ClusterError::NoReplicas(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Cluster(ClusterError::RingFull) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Engine(EngineError::ShardNotOwned(_)) => StatusCode::BAD_REQUEST,
            ApiError::Engine(EngineError::Backend(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
