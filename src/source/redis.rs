//! Redis stream source.
//!
//! Each stream entry is one change:
//!
//! ```text
//! XADD tributary:changes * operation insert payload '{"playerID":5,...}'
//! ```
//!
//! The entry ID is both the commit position and the resume marker, and its
//! millisecond part is the cluster timestamp. Reads use plain `XREAD`
//! (no consumer group): progress lives in the checkpoint store, not in Redis.

use super::{EventSource, EventStream, SourceError};
use crate::event::{ChangeEvent, OperationKind, ResumeMarker};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use deadpool_redis::redis::streams::{StreamRangeReply, StreamReadOptions, StreamReadReply};
use deadpool_redis::redis::{AsyncCommands, Value as RedisValue};
use deadpool_redis::Pool;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

/// ID that sorts before every real entry.
const STREAM_START: &str = "0-0";

/// Tails one Redis stream.
#[derive(Clone)]
pub struct RedisStreamSource {
    pool: Pool,
    stream: String,
    block_ms: usize,
    batch_size: usize,
}

impl RedisStreamSource {
    pub fn new(pool: Pool, stream: impl Into<String>, block_ms: usize, batch_size: usize) -> Self {
        Self {
            pool,
            stream: stream.into(),
            block_ms,
            batch_size: batch_size.max(1),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// ID of the newest entry, so a fresh open skips history but misses nothing after it.
    async fn current_tail(&self) -> Result<String, SourceError> {
        let mut conn = self.pool.get().await?;
        let reply: StreamRangeReply = conn.xrevrange_count(&self.stream, "+", "-", 1).await?;
        Ok(reply
            .ids
            .into_iter()
            .next()
            .map(|entry| entry.id)
            .unwrap_or_else(|| STREAM_START.to_string()))
    }
}

#[async_trait]
impl EventSource for RedisStreamSource {
    async fn open(&self, resume: Option<&ResumeMarker>) -> Result<Box<dyn EventStream>, SourceError> {
        let last_id = match resume {
            Some(marker) => marker.as_str().to_string(),
            None => self.current_tail().await?,
        };
        info!(stream = %self.stream, after = %last_id, "Opened change stream");

        Ok(Box::new(RedisEventStream {
            source: self.clone(),
            last_id,
            buffered: VecDeque::new(),
        }))
    }
}

struct RedisEventStream {
    source: RedisStreamSource,
    last_id: String,
    buffered: VecDeque<Result<ChangeEvent, SourceError>>,
}

impl RedisEventStream {
    /// One blocking `XREAD`; buffers whatever arrived and advances past it.
    async fn fill(&mut self) -> Result<(), SourceError> {
        let mut conn = self.source.pool.get().await?;
        let opts = StreamReadOptions::default()
            .block(self.source.block_ms)
            .count(self.source.batch_size);

        // A BLOCK that times out replies nil
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.source.stream], &[&self.last_id], &opts)
            .await?;

        let Some(reply) = reply else {
            return Ok(());
        };
        for stream_key in reply.keys {
            for entry in stream_key.ids {
                self.last_id = entry.id.clone();
                self.buffered.push_back(parse_entry(&entry.id, &entry.map));
            }
        }
        debug!(buffered = self.buffered.len(), last_id = %self.last_id, "Read stream batch");
        Ok(())
    }
}

#[async_trait]
impl EventStream for RedisEventStream {
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>, SourceError> {
        loop {
            if let Some(next) = self.buffered.pop_front() {
                return next.map(Some);
            }
            self.fill().await?;
        }
    }
}

/// Decode one stream entry.
fn parse_entry(id: &str, map: &HashMap<String, RedisValue>) -> Result<ChangeEvent, SourceError> {
    let malformed = |reason: String| SourceError::Malformed {
        position: id.to_string(),
        reason,
    };

    let cluster_timestamp =
        entry_timestamp(id).ok_or_else(|| malformed("entry ID has no millisecond part".into()))?;
    let operation = get_str_field(map, "operation")
        .map(|label| OperationKind::parse(&label))
        .unwrap_or(OperationKind::Insert);
    let raw = get_str_field(map, "payload").ok_or_else(|| malformed("missing payload".into()))?;
    let payload: Value =
        serde_json::from_str(&raw).map_err(|e| malformed(format!("payload is not JSON: {e}")))?;
    if !payload.is_object() {
        return Err(malformed("payload is not a JSON object".into()));
    }

    Ok(ChangeEvent::from_json(id, cluster_timestamp, operation, payload))
}

/// Millisecond part of a stream entry ID (`<millis>-<seq>`).
fn entry_timestamp(id: &str) -> Option<DateTime<Utc>> {
    let millis = id.split('-').next()?.parse::<i64>().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

/// Extract a non-empty string field from stream entry data.
fn get_str_field(map: &HashMap<String, RedisValue>, key: &str) -> Option<String> {
    let value = match map.get(key)? {
        RedisValue::BulkString(bytes) => String::from_utf8_lossy(bytes).to_string(),
        RedisValue::SimpleString(s) => s.clone(),
        _ => return None,
    };
    (!value.is_empty()).then_some(value)
}
