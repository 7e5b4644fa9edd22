//! In-process stores.
//!
//! Same semantics as the Redis backends, held in `parking_lot` mutexes.
//! Every operation completes under a single lock acquisition, which is what
//! makes the merge atomic here.

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::event::BusinessKey;
use crate::merge::{Aggregate, AggregateStore, MergeCommand, MergeOutcome};
use crate::store::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Checkpoints keyed by worker ID.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    records: Mutex<HashMap<usize, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, e.g. to simulate checkpoints left by a previous run.
    pub fn with_checkpoints(checkpoints: impl IntoIterator<Item = Checkpoint>) -> Self {
        let records = checkpoints
            .into_iter()
            .map(|cp| (cp.worker_id, cp))
            .collect();
        Self {
            records: Mutex::new(records),
        }
    }

    /// Current record for `worker_id`.
    pub fn get(&self, worker_id: usize) -> Option<Checkpoint> {
        self.records.lock().get(&worker_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<bool, StorageError> {
        let mut records = self.records.lock();
        if let Some(existing) = records.get(&checkpoint.worker_id) {
            if checkpoint.regresses(existing) {
                return Ok(false);
            }
        }
        records.insert(checkpoint.worker_id, checkpoint.clone());
        Ok(true)
    }

    async fn load_all(&self) -> Result<Vec<Checkpoint>, StorageError> {
        Ok(self.records.lock().values().cloned().collect())
    }
}

/// Aggregates keyed by `(business_key, bucket_date)`.
#[derive(Debug, Default)]
pub struct MemoryAggregateStore {
    aggregates: Mutex<HashMap<(BusinessKey, NaiveDate), Aggregate>>,
}

impl MemoryAggregateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.aggregates.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.aggregates.lock().is_empty()
    }

    /// Copy of every aggregate, in no particular order.
    pub fn snapshot(&self) -> Vec<Aggregate> {
        self.aggregates.lock().values().cloned().collect()
    }
}

#[async_trait]
impl AggregateStore for MemoryAggregateStore {
    async fn merge(&self, cmd: &MergeCommand, now: DateTime<Utc>) -> Result<MergeOutcome, StorageError> {
        let mut aggregates = self.aggregates.lock();
        let bucket = (cmd.business_key.clone(), cmd.bucket_date);
        match aggregates.get_mut(&bucket) {
            Some(existing) => Ok(existing.apply(cmd, now)),
            None => {
                aggregates.insert(bucket, Aggregate::create(cmd, now));
                Ok(MergeOutcome::Created)
            }
        }
    }

    async fn get(
        &self,
        key: &BusinessKey,
        bucket_date: NaiveDate,
    ) -> Result<Option<Aggregate>, StorageError> {
        Ok(self
            .aggregates
            .lock()
            .get(&(key.clone(), bucket_date))
            .cloned())
    }
}
