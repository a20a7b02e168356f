//! A small `reqwest`-based SDK for talking to a shardkv coordinator over its
//! HTTP API. Used by the workspace's own integration tests and usable
//! standalone by operators or client applications that don't want to
//! hand-roll JSON request bodies.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;

use shardkv_core::{ShardId, ShardSpec, StudentRow};

#[derive(Debug, thiserror::Error)]
pub enum ShardKvError {
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("coordinator returned {status}: {message}")]
    Api { status: StatusCode, message: String },
    #[error("response decoding error: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ShardKvError>;

/// A row as the coordinator's JSON API expects/returns it: the capitalized
/// `Stud_id`/`Stud_name`/`Stud_marks` field names.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Row {
    #[serde(rename = "Stud_id")]
    pub stud_id: i64,
    #[serde(rename = "Stud_name")]
    pub stud_name: String,
    #[serde(rename = "Stud_marks")]
    pub stud_marks: i64,
}

impl From<StudentRow> for Row {
    fn from(row: StudentRow) -> Self {
        Self {
            stud_id: row.stud_id,
            stud_name: row.stud_name,
            stud_marks: row.stud_marks,
        }
    }
}

impl From<Row> for StudentRow {
    fn from(row: Row) -> Self {
        Self {
            stud_id: row.stud_id,
            stud_name: row.stud_name,
            stud_marks: row.stud_marks,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplicaFailure {
    pub node: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ShardWriteResult {
    pub inserted: usize,
    #[serde(default)]
    pub failures: Vec<ReplicaFailure>,
}

#[derive(Debug, Deserialize)]
pub struct WriteOutcome {
    pub status: String,
    pub details: HashMap<String, ShardWriteResult>,
}

#[derive(Debug, Deserialize)]
pub struct ReadOutcome {
    pub shards_queried: Vec<ShardId>,
    pub data: Vec<Row>,
}

#[derive(Debug, Deserialize)]
pub struct MutateOutcome {
    pub status: String,
    pub valid_at: u64,
    #[serde(default)]
    pub failures: Vec<ReplicaFailure>,
}

#[derive(Debug, Deserialize)]
pub struct ReplicaListing {
    pub n: usize,
    pub replicas: Vec<String>,
}

/// Client for the coordinator's `/rep`, `/init`, `/add`, `/rm`, `/write`,
/// `/read`, `/update`, `/del` surface. Cheap to clone: it only wraps a
/// `reqwest::Client` and a base URL.
#[derive(Clone, Debug)]
pub struct ShardKvClient {
    base_url: String,
    client: Client,
}

impl ShardKvClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client builder never fails with these options"),
        }
    }

    async fn check(res: reqwest::Response) -> Result<reqwest::Response> {
        if res.status().is_success() {
            Ok(res)
        } else {
            let status = res.status();
            let message = res.text().await.unwrap_or_default();
            Err(ShardKvError::Api { status, message })
        }
    }

    pub async fn rep(&self) -> Result<ReplicaListing> {
        let url = format!("{}/rep", self.base_url);
        let res = Self::check(self.client.get(&url).send().await?).await?;
        Ok(res.json().await?)
    }

    pub async fn init(
        &self,
        shards: Vec<ShardSpec>,
        servers: HashMap<String, Vec<ShardId>>,
    ) -> Result<serde_json::Value> {
        let url = format!("{}/init", self.base_url);
        let body = json!({ "shards": shards, "servers": servers });
        let res = Self::check(self.client.post(&url).json(&body).send().await?).await?;
        Ok(res.json().await?)
    }

    pub async fn add(&self, n: usize, hostnames: Vec<String>) -> Result<Vec<String>> {
        let url = format!("{}/add", self.base_url);
        let body = json!({ "n": n, "hostnames": hostnames });
        let res = Self::check(self.client.post(&url).json(&body).send().await?).await?;
        Ok(res.json().await?)
    }

    pub async fn rm(&self, n: usize, hostnames: Vec<String>) -> Result<Vec<String>> {
        let url = format!("{}/rm", self.base_url);
        let body = json!({ "n": n, "hostnames": hostnames });
        let res = Self::check(self.client.delete(&url).json(&body).send().await?).await?;
        Ok(res.json().await?)
    }

    pub async fn write(&self, rows: Vec<Row>) -> Result<WriteOutcome> {
        let url = format!("{}/write", self.base_url);
        let body = json!({ "data": rows });
        let res = Self::check(self.client.post(&url).json(&body).send().await?).await?;
        Ok(res.json().await?)
    }

    pub async fn read(&self, low: i64, high: i64) -> Result<ReadOutcome> {
        let url = format!("{}/read", self.base_url);
        let body = json!({ "Stud_id": { "low": low, "high": high } });
        let res = Self::check(self.client.post(&url).json(&body).send().await?).await?;
        Ok(res.json().await?)
    }

    pub async fn update(&self, stud_id: i64, stud_name: String, stud_marks: i64) -> Result<MutateOutcome> {
        let url = format!("{}/update", self.base_url);
        let body = json!({
            "Stud_id": stud_id,
            "data": { "Stud_name": stud_name, "Stud_marks": stud_marks },
        });
        let res = Self::check(self.client.put(&url).json(&body).send().await?).await?;
        Ok(res.json().await?)
    }

    pub async fn delete(&self, stud_id: i64) -> Result<MutateOutcome> {
        let url = format!("{}/del", self.base_url);
        let body = json!({ "Stud_id": stud_id });
        let res = Self::check(self.client.delete(&url).json(&body).send().await?).await?;
        Ok(res.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_roundtrips_through_student_row() {
        let row = Row {
            stud_id: 42,
            stud_name: "A".into(),
            stud_marks: 7,
        };
        let student: StudentRow = row.clone().into();
        let back: Row = student.into();
        assert_eq!(row.stud_id, back.stud_id);
        assert_eq!(row.stud_name, back.stud_name);
        assert_eq!(row.stud_marks, back.stud_marks);
    }

    #[test]
    fn row_serializes_with_capitalized_field_names() {
        let row = Row {
            stud_id: 1,
            stud_name: "A".into(),
            stud_marks: 9,
        };
        let value = serde_json::to_value(&row).unwrap();
        assert_eq!(value["Stud_id"], 1);
        assert_eq!(value["Stud_name"], "A");
        assert_eq!(value["Stud_marks"], 9);
    }
}
