//! Redis-backed stores.
//!
//! ```text
//! tributary:checkpoints:{app}               HASH  workerID -> Checkpoint JSON
//! tributary:checkpoints:{app}:observed_at   HASH  workerID -> "<millis>:<seq>"
//! tributary:daily_txns:{i|s}:{key}:{YYYY-MM-DD}   STRING Aggregate JSON
//! ```
//!
//! `seq` is the entry sequence of the checkpointed marker, or -1 when the
//! marker is not an entry ID.

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::event::BusinessKey;
use crate::merge::{Aggregate, AggregateStore, MergeCommand, MergeOutcome};
use crate::store::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use deadpool_redis::redis::{self, AsyncCommands, Script, Value as RedisValue};
use deadpool_redis::{Connection, Pool};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Conditional upsert: only write if the stored position is not newer.
///
/// KEYS[1] records hash, KEYS[2] ordering hash;
/// ARGV[1] worker ID, ARGV[2] observed-at millis, ARGV[3] entry sequence,
/// ARGV[4] record JSON.
const SAVE_CHECKPOINT_SCRIPT: &str = r#"
local millis = tonumber(ARGV[2])
local seq = tonumber(ARGV[3])
local previous = redis.call('HGET', KEYS[2], ARGV[1])
if previous then
    local prev_millis, prev_seq = string.match(previous, '^(-?%d+):(-?%d+)$')
    if prev_millis then
        prev_millis, prev_seq = tonumber(prev_millis), tonumber(prev_seq)
    else
        prev_millis, prev_seq = tonumber(previous), -1
    end
    if prev_millis > millis or (prev_millis == millis and prev_seq > seq) then
        return 0
    end
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[4])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2] .. ':' .. ARGV[3])
return 1
"#;

/// Optimistic merge attempts before reporting a write conflict.
const MAX_CAS_ATTEMPTS: u32 = 5;

/// Checkpoints stored in one Redis hash per application.
pub struct RedisCheckpointStore {
    pool: Pool,
    records_key: String,
    order_key: String,
    save_script: Script,
}

impl RedisCheckpointStore {
    pub fn new(pool: Pool, key_prefix: &str, app_name: &str) -> Self {
        let records_key = format!("{key_prefix}:{app_name}");
        Self {
            pool,
            order_key: format!("{records_key}:observed_at"),
            records_key,
            save_script: Script::new(SAVE_CHECKPOINT_SCRIPT),
        }
    }

    pub fn records_key(&self) -> &str {
        &self.records_key
    }
}

#[async_trait]
impl CheckpointStore for RedisCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<bool, StorageError> {
        let body = serde_json::to_string(checkpoint)?;
        let mut conn = self.pool.get().await?;

        let advanced: i64 = self
            .save_script
            .key(&self.records_key)
            .key(&self.order_key)
            .arg(checkpoint.worker_id)
            .arg(checkpoint.observed_at.timestamp_millis())
            .arg(entry_sequence(checkpoint))
            .arg(body)
            .invoke_async(&mut conn)
            .await?;

        if advanced == 0 {
            debug!(
                worker = checkpoint.worker_id,
                resume_marker = %checkpoint.resume_marker,
                "Stored checkpoint is newer, not regressing"
            );
        }
        Ok(advanced == 1)
    }

    async fn load_all(&self) -> Result<Vec<Checkpoint>, StorageError> {
        let mut conn = self.pool.get().await?;
        let raw: HashMap<String, String> = conn.hgetall(&self.records_key).await?;

        let mut checkpoints = Vec::with_capacity(raw.len());
        for (field, body) in raw {
            match serde_json::from_str::<Checkpoint>(&body) {
                Ok(cp) => checkpoints.push(cp),
                Err(e) => warn!(
                    key = %self.records_key,
                    field = %field,
                    error = %e,
                    "Ignoring unreadable checkpoint record"
                ),
            }
        }
        Ok(checkpoints)
    }
}

/// Sequence half of the ordering key; -1 sorts before every real entry.
fn entry_sequence(checkpoint: &Checkpoint) -> i64 {
    checkpoint
        .resume_marker
        .position()
        .map_or(-1, |p| i64::try_from(p.seq).unwrap_or(i64::MAX))
}

/// Aggregates stored as one JSON string per `(key, day)` bucket.
pub struct RedisAggregateStore {
    pool: Pool,
    key_prefix: String,
}

impl RedisAggregateStore {
    pub fn new(pool: Pool, key_prefix: impl Into<String>) -> Self {
        Self {
            pool,
            key_prefix: key_prefix.into(),
        }
    }

    /// Redis key for a bucket.
    pub fn bucket_key(&self, key: &BusinessKey, bucket_date: NaiveDate) -> String {
        format!(
            "{}:{}:{}",
            self.key_prefix,
            key.storage_key(),
            bucket_date.format("%Y-%m-%d")
        )
    }

    /// Read the watched bucket and compute the merged body to write.
    async fn stage(
        &self,
        conn: &mut Connection,
        key: &str,
        command: &MergeCommand,
        now: DateTime<Utc>,
    ) -> Result<(String, MergeOutcome), StorageError> {
        let raw: Option<String> = conn.get(key).await?;
        let (aggregate, outcome) = match raw {
            None => (Aggregate::create(command, now), MergeOutcome::Created),
            Some(raw) => {
                let mut aggregate = serde_json::from_str::<Aggregate>(&raw)?;
                let outcome = aggregate.apply(command, now);
                (aggregate, outcome)
            }
        };
        Ok((serde_json::to_string(&aggregate)?, outcome))
    }
}

#[async_trait]
impl AggregateStore for RedisAggregateStore {
    /// `WATCH` the bucket, merge in process, `MULTI/SET/EXEC`.
    ///
    /// An aborted `EXEC` means the bucket changed in between; the merge is
    /// recomputed from the fresh value.
    async fn merge(&self, command: &MergeCommand, now: DateTime<Utc>) -> Result<MergeOutcome, StorageError> {
        let key = self.bucket_key(&command.business_key, command.bucket_date);
        let mut conn = self.pool.get().await?;

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let _: () = redis::cmd("WATCH").arg(&key).query_async(&mut conn).await?;

            let (body, outcome) = match self.stage(&mut conn, &key, command, now).await {
                Ok(staged) => staged,
                Err(e) => {
                    // Keep the pooled connection free of a stale WATCH
                    let _: Result<(), _> = redis::cmd("UNWATCH").query_async(&mut conn).await;
                    return Err(e);
                }
            };

            let reply: RedisValue = redis::pipe()
                .atomic()
                .set(&key, body)
                .query_async(&mut conn)
                .await?;
            if !matches!(reply, RedisValue::Nil) {
                return Ok(outcome);
            }

            debug!(key = %key, attempt = attempt, "Bucket changed during merge, retrying");
        }

        Err(StorageError::WriteConflict(format!(
            "{key}: bucket kept changing over {MAX_CAS_ATTEMPTS} attempts"
        )))
    }

    async fn get(
        &self,
        key: &BusinessKey,
        bucket_date: NaiveDate,
    ) -> Result<Option<Aggregate>, StorageError> {
        let mut conn = self.pool.get().await?;
        let raw: Option<String> = conn.get(self.bucket_key(key, bucket_date)).await?;
        raw.map(|body| serde_json::from_str(&body).map_err(StorageError::from))
            .transpose()
    }
}
