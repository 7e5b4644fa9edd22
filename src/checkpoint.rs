//! Per-worker checkpoints and resume-point selection.
//!
//! Every worker owns exactly one [`Checkpoint`] record, upserted by worker
//! ID after each handled event. At startup the supervisor resumes the single
//! shared stream from the **oldest** checkpoint across all workers: no lane
//! can skip an event it has not handled yet, and lanes that were ahead see
//! some events again (the merge is idempotent, so that is safe).

use crate::event::{ResumeMarker, StreamPosition};
use crate::store::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Durable progress record for one worker lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Lane index; the unique key of the record
    #[serde(rename = "workerID")]
    pub worker_id: usize,

    /// Where the stream resumes for this lane
    pub resume_marker: ResumeMarker,

    /// Cluster time of the checkpointed event
    pub observed_at: DateTime<Utc>,

    /// Application that wrote the record
    pub app_name: String,
}

impl Checkpoint {
    pub fn new(
        worker_id: usize,
        resume_marker: ResumeMarker,
        observed_at: DateTime<Utc>,
        app_name: impl Into<String>,
    ) -> Self {
        Self {
            worker_id,
            resume_marker,
            observed_at,
            app_name: app_name.into(),
        }
    }

    /// Stream order of the checkpointed event.
    ///
    /// Several entries share a millisecond, so cluster time alone is not a
    /// total order; the entry sequence breaks those ties. Markers that are not
    /// entry IDs sort before any that are within the same instant.
    pub fn order_key(&self) -> (DateTime<Utc>, Option<StreamPosition>) {
        (self.observed_at, self.resume_marker.position())
    }

    /// Whether writing `self` over `existing` would move the lane backwards.
    pub fn regresses(&self, existing: &Checkpoint) -> bool {
        self.order_key() < existing.order_key()
    }
}

/// Persistence for per-worker checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Upsert the record for `checkpoint.worker_id`.
    ///
    /// Returns `Ok(false)` when the stored record is newer and was left alone:
    /// a worker's checkpoint never moves backwards.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<bool, StorageError>;

    /// Every readable checkpoint, in no particular order.
    ///
    /// Missing lanes are simply absent; undecodable records are skipped.
    async fn load_all(&self) -> Result<Vec<Checkpoint>, StorageError>;

    /// The global resume position: the oldest checkpoint, or `None` on a fresh start.
    async fn load_resume_position(&self) -> Result<Option<Checkpoint>, StorageError> {
        let checkpoints = self.load_all().await?;
        debug!(count = checkpoints.len(), "Loaded checkpoints");

        let earliest = earliest(checkpoints);
        match &earliest {
            Some(cp) => info!(
                worker = cp.worker_id,
                resume_marker = %cp.resume_marker,
                observed_at = %cp.observed_at,
                "Resolved resume position from oldest checkpoint"
            ),
            None => info!("No checkpoints found, starting from the current stream position"),
        }
        Ok(earliest)
    }
}

/// Pick the checkpoint furthest back in the stream.
///
/// Only checkpoints at the very same position fall back to the lowest worker
/// ID, which keeps the choice deterministic.
pub fn earliest(checkpoints: impl IntoIterator<Item = Checkpoint>) -> Option<Checkpoint> {
    checkpoints
        .into_iter()
        .min_by(|a, b| {
            a.order_key()
                .cmp(&b.order_key())
                .then(a.worker_id.cmp(&b.worker_id))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cp(worker: usize, secs: i64) -> Checkpoint {
        Checkpoint::new(
            worker,
            ResumeMarker::new(format!("marker-{secs}")),
            Utc.timestamp_opt(secs, 0).unwrap(),
            "test",
        )
    }

    #[test]
    fn test_earliest_picks_minimum() {
        let picked = earliest(vec![cp(0, 5), cp(1, 3), cp(2, 8)]).unwrap();
        assert_eq!(picked.worker_id, 1);
        assert_eq!(picked.resume_marker.as_str(), "marker-3");
    }

    #[test]
    fn test_earliest_empty_is_none() {
        assert!(earliest(Vec::new()).is_none());
    }

    /// Checkpoint at stream entry `id`, observed at the entry's millisecond.
    fn at_entry(worker: usize, id: &str) -> Checkpoint {
        let millis = id.split('-').next().unwrap().parse().unwrap();
        Checkpoint::new(
            worker,
            ResumeMarker::new(id),
            Utc.timestamp_millis_opt(millis).unwrap(),
            "test",
        )
    }

    #[test]
    fn test_earliest_tie_breaks_on_worker() {
        let picked = earliest(vec![cp(3, 4), cp(1, 4)]).unwrap();
        assert_eq!(picked.worker_id, 1);
    }

    #[test]
    fn test_earliest_same_millisecond_uses_sequence() {
        // Lane 1 is behind even though both lanes are in the same millisecond
        let picked = earliest(vec![at_entry(0, "1000-7"), at_entry(1, "1000-2")]).unwrap();
        assert_eq!(picked.worker_id, 1);
        assert_eq!(picked.resume_marker.as_str(), "1000-2");

        // Numeric, not lexical: 1000-10 is after 1000-9
        let picked = earliest(vec![at_entry(0, "1000-10"), at_entry(1, "1000-9")]).unwrap();
        assert_eq!(picked.resume_marker.as_str(), "1000-9");
    }

    #[test]
    fn test_regresses() {
        assert!(cp(0, 3).regresses(&cp(0, 5)));
        assert!(!cp(0, 5).regresses(&cp(0, 5)));
        assert!(!cp(0, 6).regresses(&cp(0, 5)));
    }

    #[test]
    fn test_regresses_within_millisecond() {
        assert!(at_entry(0, "1000-1").regresses(&at_entry(0, "1000-5")));
        assert!(!at_entry(0, "1000-5").regresses(&at_entry(0, "1000-5")));
        assert!(!at_entry(0, "1000-10").regresses(&at_entry(0, "1000-5")));
        assert!(at_entry(0, "999-50").regresses(&at_entry(0, "1000-0")));
    }

    #[test]
    fn test_checkpoint_json_shape() {
        let json = serde_json::to_value(cp(2, 10)).unwrap();
        assert_eq!(json["workerID"], 2);
        assert_eq!(json["resumeMarker"], "marker-10");
        assert_eq!(json["appName"], "test");
        assert!(json.get("observedAt").is_some());

        let back: Checkpoint = serde_json::from_value(json).unwrap();
        assert_eq!(back, cp(2, 10));
    }
}
