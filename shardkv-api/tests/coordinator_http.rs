//! HTTP-level scenarios against the coordinator router, driven through an
//! in-process `axum::Router` via `axum_test` — no real sockets, no real
//! replica processes. The mock transport/spawner pair stands in for the
//! inter-node transport and the container runtime.

use std::sync::Arc;

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::json;

use shardkv_api::{build_coordinator_router, CoordinatorState};
use shardkv_cluster::testing::{MockReplicaSpawner, MockReplicaTransport};
use shardkv_cluster::CoordinatorConfig;

fn server() -> TestServer {
    let transport = Arc::new(MockReplicaTransport::new());
    let spawner = Arc::new(MockReplicaSpawner::new(transport.clone()));
    let state = CoordinatorState::replicated(CoordinatorConfig::default(), transport, spawner);
    TestServer::new(build_coordinator_router(state)).unwrap()
}

fn three_shard_init_body() -> serde_json::Value {
    json!({
        "shards": [
            {"shard_id": "sh1", "stud_id_low": 0, "shard_size": 1000},
            {"shard_id": "sh2", "stud_id_low": 1000, "shard_size": 1000},
            {"shard_id": "sh3", "stud_id_low": 2000, "shard_size": 1000},
        ],
        "servers": {
            "s1": ["sh1", "sh2", "sh3"],
            "s2": ["sh1", "sh2", "sh3"],
        }
    })
}

/// Scenario 1: init, write one row, range-read that only covers sh1.
#[tokio::test]
async fn init_write_read_returns_one_row_and_the_right_shard() {
    let server = server();

    let res = server.post("/init").json(&three_shard_init_body()).await;
    assert_eq!(res.status_code(), StatusCode::OK);

    let res = server
        .post("/write")
        .json(&json!({ "data": [{"Stud_id": 42, "Stud_name": "A", "Stud_marks": 7}] }))
        .await;
    assert_eq!(res.status_code(), StatusCode::OK);

    let res = server
        .post("/read")
        .json(&json!({ "Stud_id": {"low": 0, "high": 100} }))
        .await;
    assert_eq!(res.status_code(), StatusCode::OK);
    let body: serde_json::Value = res.json();
    assert_eq!(body["shards_queried"], json!(["sh1"]));
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"][0]["Stud_id"], 42);
}

/// Scenario 6: a read spanning [500, 2500] touches every intersecting shard.
#[tokio::test]
async fn read_reports_every_intersecting_shard() {
    let server = server();
    server.post("/init").json(&three_shard_init_body()).await;

    let res = server
        .post("/read")
        .json(&json!({ "Stud_id": {"low": 500, "high": 2500} }))
        .await;
    assert_eq!(res.status_code(), StatusCode::OK);
    let body: serde_json::Value = res.json();
    assert_eq!(body["shards_queried"], json!(["sh1", "sh2", "sh3"]));
}

/// Write, then update, then delete the same row; `valid_at` strictly
/// increases with each accepted mutation.
#[tokio::test]
async fn write_update_delete_advance_valid_at() {
    let server = server();
    server.post("/init").json(&three_shard_init_body()).await;

    server
        .post("/write")
        .json(&json!({ "data": [{"Stud_id": 7, "Stud_name": "orig", "Stud_marks": 10}] }))
        .await;

    let res = server
        .put("/update")
        .json(&json!({ "Stud_id": 7, "data": {"Stud_name": "updated", "Stud_marks": 20} }))
        .await;
    assert_eq!(res.status_code(), StatusCode::OK);
    let update_body: serde_json::Value = res.json();
    let after_update = update_body["valid_at"].as_u64().unwrap();

    let res = server.delete("/del").json(&json!({ "Stud_id": 7 })).await;
    assert_eq!(res.status_code(), StatusCode::OK);
    let delete_body: serde_json::Value = res.json();
    let after_delete = delete_body["valid_at"].as_u64().unwrap();

    assert!(after_delete > after_update);

    let res = server
        .post("/read")
        .json(&json!({ "Stud_id": {"low": 0, "high": 100} }))
        .await;
    let body: serde_json::Value = res.json();
    assert!(body["data"].as_array().unwrap().is_empty());
}

/// A `/read` body missing the `Stud_id` range is a client error, not axum's
/// generic 422 for a malformed body.
#[tokio::test]
async fn read_missing_range_is_bad_request() {
    let server = server();
    server.post("/init").json(&three_shard_init_body()).await;

    let res = server.post("/read").json(&json!({})).await;
    assert_eq!(res.status_code(), StatusCode::BAD_REQUEST);
}

/// An out-of-range stud_id is a client error, not a server error.
#[tokio::test]
async fn write_out_of_range_is_bad_request() {
    let server = server();
    server.post("/init").json(&three_shard_init_body()).await;

    let res = server
        .post("/write")
        .json(&json!({ "data": [{"Stud_id": 999_999, "Stud_name": "A", "Stud_marks": 1}] }))
        .await;
    assert_eq!(res.status_code(), StatusCode::BAD_REQUEST);
}

/// `/add`/`/rm` reject a hostnames list longer than n.
#[tokio::test]
async fn add_and_rm_reject_too_many_hostnames() {
    let server = server();

    let res = server
        .post("/add")
        .json(&json!({ "n": 1, "hostnames": ["a", "b"] }))
        .await;
    assert_eq!(res.status_code(), StatusCode::BAD_REQUEST);

    let res = server
        .delete("/rm")
        .json(&json!({ "n": 1, "hostnames": ["a", "b"] }))
        .await;
    assert_eq!(res.status_code(), StatusCode::BAD_REQUEST);
}

/// `/rep` reports the replica set after `/add` grows it.
#[tokio::test]
async fn rep_reflects_added_replicas() {
    let server = server();

    let res = server
        .post("/add")
        .json(&json!({ "n": 3, "hostnames": ["S1", "S2"] }))
        .await;
    assert_eq!(res.status_code(), StatusCode::OK);

    let res = server.get("/rep").await;
    assert_eq!(res.status_code(), StatusCode::OK);
    let body: serde_json::Value = res.json();
    assert_eq!(body["n"], 3);
    assert_eq!(body["replicas"].as_array().unwrap().len(), 3);
}

/// `/rep` in replicated mode also surfaces the shard table, not just a count.
#[tokio::test]
async fn rep_includes_shard_table_in_replicated_mode() {
    let server = server();
    server.post("/init").json(&three_shard_init_body()).await;

    let res = server.get("/rep").await;
    assert_eq!(res.status_code(), StatusCode::OK);
    let body: serde_json::Value = res.json();
    let shards = body["shards"].as_array().unwrap();
    assert_eq!(shards.len(), 3);
}
