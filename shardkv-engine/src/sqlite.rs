//! Durable `ShardStore` backed by SQLite, with a `term_t`/`stud_t` schema
//! and the `apply_rules` SQL the replica process runs. Gated behind the
//! `sqlite` feature; the in-memory store is the default because replicas
//! are disposable and recovery always restores a fresh replacement from a
//! donor rather than from its own durable state.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use shardkv_core::{RowVersion, ShardId, StudentRow};

use crate::{EngineError, EngineResult, KeyRange, ShardStore, WriteRow};

pub struct SqliteShardStore {
    pool: SqlitePool,
    owned: RwLock<HashSet<ShardId>>,
}

impl SqliteShardStore {
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new().max_connections(1).connect(url).await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS term_t (shard_id TEXT PRIMARY KEY, term INTEGER NOT NULL DEFAULT 0)",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS stud_t (
                stud_id INTEGER NOT NULL,
                stud_name TEXT NOT NULL,
                stud_marks INTEGER NOT NULL,
                shard_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                deleted_at INTEGER,
                PRIMARY KEY (stud_id, created_at, shard_id)
            )",
        )
        .execute(&pool)
        .await?;
        Ok(Self {
            pool,
            owned: RwLock::new(HashSet::new()),
        })
    }

    async fn apply_rules(&self, shard: &str, valid_at: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "DELETE FROM stud_t WHERE shard_id = ?1
             AND (created_at > ?2 OR (deleted_at IS NOT NULL AND deleted_at <= ?2))",
        )
        .bind(shard)
        .bind(valid_at)
        .execute(&self.pool)
        .await?;

        sqlx::query("UPDATE stud_t SET deleted_at = NULL WHERE shard_id = ?1 AND deleted_at > ?2")
            .bind(shard)
            .bind(valid_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn term_of(&self, shard: &str) -> Result<i64, sqlx::Error> {
        let row = sqlx::query("SELECT term FROM term_t WHERE shard_id = ?1")
            .bind(shard)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("term"))
    }

    async fn set_term(&self, shard: &str, term: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE term_t SET term = ?1 WHERE shard_id = ?2")
            .bind(term)
            .bind(shard)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ShardStore for SqliteShardStore {
    async fn configure(&self, shards: &[ShardId]) -> EngineResult<()> {
        for shard in shards {
            sqlx::query("INSERT INTO term_t (shard_id, term) VALUES (?1, 0) ON CONFLICT (shard_id) DO NOTHING")
                .bind(shard.as_str())
                .execute(&self.pool)
                .await
                .map_err(|e| EngineError::Backend(e.to_string()))?;
            self.owned.write().unwrap().insert(shard.clone());
        }
        Ok(())
    }

    async fn write(
        &self,
        shard: &ShardId,
        valid_at: u64,
        rows: &[WriteRow],
        admin: bool,
    ) -> EngineResult<u64> {
        if !self.owns(shard) {
            return Err(EngineError::ShardNotOwned(shard.clone()));
        }
        let valid_at = valid_at as i64;
        let term = if admin {
            valid_at
        } else {
            self.apply_rules(shard.as_str(), valid_at)
                .await
                .map_err(|e| EngineError::Backend(e.to_string()))?;
            let current = self
                .term_of(shard.as_str())
                .await
                .map_err(|e| EngineError::Backend(e.to_string()))?;
            current.max(valid_at) + 1
        };

        for row in rows {
            // `ON CONFLICT DO NOTHING` on the (stud_id, created_at, shard_id)
            // primary key makes admin-mode replay idempotent: recovery may
            // copy-and-replay the same donor row twice without duplicating it.
            sqlx::query(
                "INSERT INTO stud_t (stud_id, stud_name, stud_marks, shard_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (stud_id, created_at, shard_id) DO NOTHING",
            )
            .bind(row.stud_id)
            .bind(&row.stud_name)
            .bind(row.stud_marks)
            .bind(shard.as_str())
            .bind(term)
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::Backend(e.to_string()))?;
        }

        if !admin {
            self.set_term(shard.as_str(), term)
                .await
                .map_err(|e| EngineError::Backend(e.to_string()))?;
        }
        Ok(term as u64)
    }

    async fn read(
        &self,
        shard: &ShardId,
        valid_at: u64,
        range: KeyRange,
    ) -> EngineResult<Vec<StudentRow>> {
        if !self.owns(shard) {
            return Err(EngineError::ShardNotOwned(shard.clone()));
        }
        let valid_at = valid_at as i64;
        self.apply_rules(shard.as_str(), valid_at)
            .await
            .map_err(|e| EngineError::Backend(e.to_string()))?;

        let rows = sqlx::query(
            "SELECT stud_id, stud_name, stud_marks FROM stud_t
             WHERE shard_id = ?1 AND stud_id BETWEEN ?2 AND ?3
               AND created_at <= ?4 AND (deleted_at IS NULL OR deleted_at > ?4)",
        )
        .bind(shard.as_str())
        .bind(range.low)
        .bind(range.high)
        .bind(valid_at)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::Backend(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|r| StudentRow {
                stud_id: r.get("stud_id"),
                stud_name: r.get("stud_name"),
                stud_marks: r.get("stud_marks"),
            })
            .collect())
    }

    async fn update(
        &self,
        shard: &ShardId,
        valid_at: u64,
        stud_id: i64,
        new_row: WriteRow,
    ) -> EngineResult<u64> {
        if !self.owns(shard) {
            return Err(EngineError::ShardNotOwned(shard.clone()));
        }
        let valid_at = valid_at as i64;
        self.apply_rules(shard.as_str(), valid_at)
            .await
            .map_err(|e| EngineError::Backend(e.to_string()))?;

        let current = self
            .term_of(shard.as_str())
            .await
            .map_err(|e| EngineError::Backend(e.to_string()))?;
        let tombstone_term = current.max(valid_at) + 1;

        sqlx::query(
            "UPDATE stud_t SET deleted_at = ?1 WHERE shard_id = ?2 AND stud_id = ?3 AND created_at <= ?4 AND deleted_at IS NULL",
        )
        .bind(tombstone_term)
        .bind(shard.as_str())
        .bind(stud_id)
        .bind(valid_at)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Backend(e.to_string()))?;

        let insert_term = tombstone_term + 1;
        sqlx::query(
            "INSERT INTO stud_t (stud_id, stud_name, stud_marks, shard_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(new_row.stud_id)
        .bind(&new_row.stud_name)
        .bind(new_row.stud_marks)
        .bind(shard.as_str())
        .bind(insert_term)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Backend(e.to_string()))?;

        self.set_term(shard.as_str(), insert_term)
            .await
            .map_err(|e| EngineError::Backend(e.to_string()))?;
        Ok(insert_term as u64)
    }

    async fn delete(&self, shard: &ShardId, valid_at: u64, stud_id: i64) -> EngineResult<u64> {
        if !self.owns(shard) {
            return Err(EngineError::ShardNotOwned(shard.clone()));
        }
        let valid_at = valid_at as i64;
        self.apply_rules(shard.as_str(), valid_at)
            .await
            .map_err(|e| EngineError::Backend(e.to_string()))?;

        let current = self
            .term_of(shard.as_str())
            .await
            .map_err(|e| EngineError::Backend(e.to_string()))?;
        let new_term = current.max(valid_at) + 1;

        sqlx::query(
            "UPDATE stud_t SET deleted_at = ?1 WHERE shard_id = ?2 AND stud_id = ?3 AND created_at <= ?4 AND deleted_at IS NULL",
        )
        .bind(new_term)
        .bind(shard.as_str())
        .bind(stud_id)
        .bind(valid_at)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Backend(e.to_string()))?;

        self.set_term(shard.as_str(), new_term)
            .await
            .map_err(|e| EngineError::Backend(e.to_string()))?;
        Ok(new_term as u64)
    }

    async fn copy(
        &self,
        shards: &[ShardId],
        valid_ats: &[u64],
    ) -> EngineResult<HashMap<ShardId, Vec<RowVersion>>> {
        let mut out = HashMap::new();
        for (shard, valid_at) in shards.iter().zip(valid_ats.iter()) {
            if !self.owns(shard) {
                return Err(EngineError::ShardNotOwned(shard.clone()));
            }
            let valid_at = *valid_at as i64;
            self.apply_rules(shard.as_str(), valid_at)
                .await
                .map_err(|e| EngineError::Backend(e.to_string()))?;

            let rows = sqlx::query(
                "SELECT stud_id, stud_name, stud_marks, created_at, deleted_at FROM stud_t
                 WHERE shard_id = ?1 AND created_at <= ?2",
            )
            .bind(shard.as_str())
            .bind(valid_at)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EngineError::Backend(e.to_string()))?;

            let versions = rows
                .into_iter()
                .map(|r| RowVersion {
                    stud_id: r.get("stud_id"),
                    stud_name: r.get("stud_name"),
                    stud_marks: r.get("stud_marks"),
                    shard_id: shard.clone(),
                    created_at: r.get::<i64, _>("created_at") as u64,
                    deleted_at: r.get::<Option<i64>, _>("deleted_at").map(|d| d as u64),
                })
                .collect();
            out.insert(shard.clone(), versions);
        }
        Ok(out)
    }

    fn owns(&self, shard: &ShardId) -> bool {
        self.owned.read().unwrap().contains(shard)
    }
}
