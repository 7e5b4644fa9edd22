//! Per-event processing on a worker lane.
//!
//! [`RetryingDispatcher::process`] is what a worker runs for each event it
//! owns:
//!
//! ```text
//! record TPS, lag, handled++
//!   │
//!   ▼
//! retry( merge ──> save checkpoint )      duration observed per attempt
//!   │
//!   ├─ Ok                 -> succeeded++
//!   ├─ InvalidDocument    -> dropped{invalid_document}, checkpoint anyway
//!   ├─ retries exhausted  -> dropped{retries_exhausted}
//!   └─ fatal              -> dropped{fatal}
//! ```
//!
//! Nothing in here returns an error to the lane: every failure is logged,
//! counted, and the lane moves on to its next event.

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::event::ChangeEvent;
use crate::merge::{MergeError, MergeHandler, MergeOutcome};
use crate::metrics::{DropReason, MetricsSink};
use crate::retry::{FailureClass, RetryError, RetryPolicy};
use crate::store::StorageError;
use crate::tps::TpsTracker;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Failure of one merge-then-checkpoint attempt.
#[derive(Debug, Error)]
enum UnitError {
    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("checkpoint write failed: {0}")]
    Checkpoint(StorageError),
}

fn classify_storage(e: &StorageError) -> FailureClass {
    if e.is_transient() {
        FailureClass::Transient
    } else {
        FailureClass::Fatal
    }
}

fn classify_unit(e: &UnitError) -> FailureClass {
    match e {
        UnitError::Merge(MergeError::InvalidDocument { .. }) => FailureClass::Validation,
        UnitError::Merge(MergeError::Storage(e)) | UnitError::Checkpoint(e) => classify_storage(e),
    }
}

/// What happened to one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Merged(MergeOutcome),
    InvalidDocument,
    RetriesExhausted,
    Fatal,
}

/// Runs the merge and checkpoint for one event under the retry policy.
pub struct RetryingDispatcher {
    handler: MergeHandler,
    checkpoints: Arc<dyn CheckpointStore>,
    metrics: Arc<MetricsSink>,
    tps: Arc<TpsTracker>,
    policy: RetryPolicy,
    app_name: String,
}

impl RetryingDispatcher {
    pub fn new(
        handler: MergeHandler,
        checkpoints: Arc<dyn CheckpointStore>,
        metrics: Arc<MetricsSink>,
        tps: Arc<TpsTracker>,
        policy: RetryPolicy,
        app_name: impl Into<String>,
    ) -> Self {
        Self {
            handler,
            checkpoints,
            metrics,
            tps,
            policy,
            app_name: app_name.into(),
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsSink> {
        &self.metrics
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Process one event on `worker`'s lane.
    pub async fn process(&self, worker: usize, event: &ChangeEvent) -> DispatchOutcome {
        let tps = self.tps.record_event(worker);
        self.metrics.record_tps(worker, tps);
        self.metrics.record_handled();
        let lag = self.metrics.record_lag(worker, event.cluster_timestamp);

        debug!(
            worker = worker,
            position = %event.commit_position,
            operation = %event.operation,
            lag_secs = lag,
            "Processing event"
        );

        let checkpoint = Checkpoint::new(
            worker,
            event.resume_marker.clone(),
            event.cluster_timestamp,
            self.app_name.as_str(),
        );
        let checkpoint = &checkpoint;

        let result = self
            .policy
            .run(classify_unit, |_| async move {
                let started = Instant::now();
                let result = self.attempt(event, checkpoint).await;
                self.metrics.observe_duration(started.elapsed());
                result
            })
            .await;

        match result {
            Ok(outcome) => {
                self.metrics.record_success();
                DispatchOutcome::Merged(outcome)
            }
            Err(RetryError::Rejected(e)) => {
                warn!(
                    worker = worker,
                    position = %event.commit_position,
                    error = %e,
                    "Skipping invalid document"
                );
                self.metrics.record_dropped(DropReason::InvalidDocument);
                // Still advance the lane so bad documents never pin the resume position
                self.checkpoint_only(checkpoint).await;
                DispatchOutcome::InvalidDocument
            }
            Err(RetryError::Exhausted { attempts, source }) => {
                error!(
                    worker = worker,
                    position = %event.commit_position,
                    attempts = attempts,
                    error = %source,
                    "Retries exhausted, dropping event"
                );
                self.metrics.record_dropped(DropReason::RetriesExhausted);
                DispatchOutcome::RetriesExhausted
            }
            Err(RetryError::Fatal(e)) => {
                error!(
                    worker = worker,
                    position = %event.commit_position,
                    error = %e,
                    "Unrecoverable failure, dropping event"
                );
                self.metrics.record_dropped(DropReason::Fatal);
                DispatchOutcome::Fatal
            }
        }
    }

    async fn attempt(
        &self,
        event: &ChangeEvent,
        checkpoint: &Checkpoint,
    ) -> Result<MergeOutcome, UnitError> {
        let outcome = self.handler.handle(event).await?;
        self.save(checkpoint).await.map_err(UnitError::Checkpoint)?;
        Ok(outcome)
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        let advanced = self.checkpoints.save(checkpoint).await?;
        debug!(
            worker = checkpoint.worker_id,
            resume_marker = %checkpoint.resume_marker,
            advanced = advanced,
            "Saved checkpoint"
        );
        Ok(())
    }

    async fn checkpoint_only(&self, checkpoint: &Checkpoint) {
        let result = self
            .policy
            .run(classify_storage, |_| self.save(checkpoint))
            .await;
        if let Err(e) = result {
            error!(
                worker = checkpoint.worker_id,
                resume_marker = %checkpoint.resume_marker,
                error = %e.into_inner(),
                "Failed to checkpoint skipped event"
            );
        }
    }
}
