//! Fixed pool of sequential worker lanes.
//!
//! ```text
//!               ┌── lane 0: queue ─> task, task, ...   (one at a time)
//! submit(i, t) ─┼── lane 1: queue ─> task, task, ...
//!               └── lane N-1 ...
//! ```
//!
//! Each lane is one tokio task draining its own unbounded queue, so tasks
//! submitted to the same lane run strictly in submission order while lanes
//! run concurrently with each other. A panicking task or completion callback
//! is caught at the lane boundary: the lane logs it and continues with its
//! next task.
//!
//! [`WorkerPool::shutdown`] closes every queue, gives all lanes one shared
//! deadline to finish what they hold, then aborts the rest and reports what
//! was abandoned.

use crate::metrics::{DropReason, MetricsSink};
use futures::FutureExt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type BoxTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
type Callback = Box<dyn FnOnce(TaskOutcome) + Send + 'static>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no worker {worker} in a pool of {workers}")]
    UnknownWorker { worker: usize, workers: usize },

    #[error("worker {worker} is no longer accepting tasks")]
    Closed { worker: usize },
}

/// How a submitted task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Panicked,
}

struct Job {
    task: BoxTask,
    on_done: Option<Callback>,
}

struct Lane {
    sender: mpsc::UnboundedSender<Job>,
    pending: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

/// A lane that missed the drain deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbandonedLane {
    pub worker: usize,
    /// Queued plus in-flight tasks at the moment the lane was aborted
    pub pending: usize,
}

/// Result of [`WorkerPool::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub workers: usize,
    pub abandoned: Vec<AbandonedLane>,
}

impl DrainReport {
    /// Every lane finished its queue before the deadline.
    pub fn is_clean(&self) -> bool {
        self.abandoned.is_empty()
    }

    pub fn abandoned_tasks(&self) -> usize {
        self.abandoned.iter().map(|lane| lane.pending).sum()
    }
}

/// N independent sequential executors, addressed by index.
pub struct WorkerPool {
    lanes: Vec<Lane>,
}

impl WorkerPool {
    /// Start `workers` lanes on the current runtime.
    pub fn new(workers: usize) -> Self {
        Self::build(workers, None)
    }

    /// Like [`WorkerPool::new`], counting panicked tasks as fatal drops.
    pub fn with_metrics(workers: usize, metrics: Arc<MetricsSink>) -> Self {
        Self::build(workers, Some(metrics))
    }

    fn build(workers: usize, metrics: Option<Arc<MetricsSink>>) -> Self {
        let lanes = (0..workers)
            .map(|worker| {
                let (sender, receiver) = mpsc::unbounded_channel();
                let pending = Arc::new(AtomicUsize::new(0));
                let handle = tokio::spawn(run_lane(
                    worker,
                    receiver,
                    pending.clone(),
                    metrics.clone(),
                ));
                Lane {
                    sender,
                    pending,
                    handle,
                }
            })
            .collect();
        info!(workers = workers, "Worker pool started");
        Self { lanes }
    }

    pub fn workers(&self) -> usize {
        self.lanes.len()
    }

    /// Queued plus in-flight tasks on `worker`.
    pub fn pending(&self, worker: usize) -> usize {
        self.lanes
            .get(worker)
            .map(|lane| lane.pending.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Queue `task` on `worker`'s lane without waiting for it.
    pub fn submit<F>(&self, worker: usize, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.enqueue(worker, Box::pin(task), None)
    }

    /// Queue `task` and call `on_done` with its outcome once it has run.
    pub fn submit_with<F, D>(&self, worker: usize, task: F, on_done: D) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
        D: FnOnce(TaskOutcome) + Send + 'static,
    {
        self.enqueue(worker, Box::pin(task), Some(Box::new(on_done)))
    }

    fn enqueue(&self, worker: usize, task: BoxTask, on_done: Option<Callback>) -> Result<(), PoolError> {
        let lane = self.lanes.get(worker).ok_or(PoolError::UnknownWorker {
            worker,
            workers: self.lanes.len(),
        })?;

        lane.pending.fetch_add(1, Ordering::SeqCst);
        if lane.sender.send(Job { task, on_done }).is_err() {
            lane.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(PoolError::Closed { worker });
        }
        Ok(())
    }

    /// Stop accepting tasks and drain every lane within `timeout`.
    ///
    /// Lanes still busy at the deadline are aborted; their pending work is
    /// reported, not retried.
    pub async fn shutdown(self, timeout: Duration) -> DrainReport {
        let deadline = tokio::time::Instant::now() + timeout;
        let workers = self.lanes.len();

        let lanes: Vec<_> = self
            .lanes
            .into_iter()
            .map(|lane| {
                // Closing the queue lets the lane exit once it is empty
                drop(lane.sender);
                (lane.pending, lane.handle)
            })
            .collect();

        let mut report = DrainReport {
            workers,
            abandoned: Vec::new(),
        };
        for (worker, (pending, mut handle)) in lanes.into_iter().enumerate() {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => debug!(worker = worker, "Lane drained"),
                Ok(Err(e)) => error!(worker = worker, error = %e, "Lane task failed"),
                Err(_) => {
                    handle.abort();
                    let pending = pending.load(Ordering::SeqCst);
                    warn!(
                        worker = worker,
                        pending = pending,
                        "Lane did not drain before the deadline, cancelling"
                    );
                    report.abandoned.push(AbandonedLane { worker, pending });
                }
            }
        }

        info!(
            workers = workers,
            abandoned_lanes = report.abandoned.len(),
            abandoned_tasks = report.abandoned_tasks(),
            "Worker pool stopped"
        );
        report
    }
}

async fn run_lane(
    worker: usize,
    mut receiver: mpsc::UnboundedReceiver<Job>,
    pending: Arc<AtomicUsize>,
    metrics: Option<Arc<MetricsSink>>,
) {
    while let Some(Job { task, on_done }) = receiver.recv().await {
        let outcome = match AssertUnwindSafe(task).catch_unwind().await {
            Ok(()) => TaskOutcome::Completed,
            Err(_) => {
                error!(worker = worker, "Task panicked, lane continues");
                if let Some(metrics) = &metrics {
                    metrics.record_dropped(DropReason::Fatal);
                }
                TaskOutcome::Panicked
            }
        };
        pending.fetch_sub(1, Ordering::SeqCst);
        if let Some(on_done) = on_done {
            if panic::catch_unwind(AssertUnwindSafe(|| on_done(outcome))).is_err() {
                error!(worker = worker, "Completion callback panicked, lane continues");
            }
        }
    }
    debug!(worker = worker, "Lane queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::sync::oneshot;

    #[tokio::test(start_paused = true)]
    async fn test_same_lane_runs_in_submission_order() {
        let pool = WorkerPool::new(2);
        let log = Arc::new(Mutex::new(Vec::new()));

        // Earlier tasks sleep longer; FIFO must still hold
        for i in 0..5u64 {
            let log = log.clone();
            pool.submit(0, async move {
                log.lock().push(format!("start {i}"));
                tokio::time::sleep(Duration::from_millis(50 - i * 10)).await;
                log.lock().push(format!("end {i}"));
            })
            .unwrap();
        }

        let report = pool.shutdown(Duration::from_secs(5)).await;
        assert!(report.is_clean());

        let expected: Vec<String> = (0..5)
            .flat_map(|i| [format!("start {i}"), format!("end {i}")])
            .collect();
        assert_eq!(*log.lock(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lanes_run_concurrently() {
        let pool = WorkerPool::new(2);
        let (tx, rx) = oneshot::channel::<()>();
        let finished = Arc::new(AtomicUsize::new(0));

        // Lane 0 waits on lane 1; this only completes if they overlap
        let done = finished.clone();
        pool.submit(0, async move {
            rx.await.unwrap();
            done.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        pool.submit(1, async move {
            tx.send(()).unwrap();
        })
        .unwrap();

        let report = pool.shutdown(Duration::from_secs(1)).await;
        assert!(report.is_clean());
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panic_does_not_kill_lane() {
        let pool = WorkerPool::new(1);
        let outcomes = Arc::new(Mutex::new(Vec::new()));

        let seen = outcomes.clone();
        pool.submit_with(0, async { panic!("boom") }, move |o| seen.lock().push(o))
            .unwrap();
        let seen = outcomes.clone();
        pool.submit_with(0, async {}, move |o| seen.lock().push(o))
            .unwrap();

        let report = pool.shutdown(Duration::from_secs(5)).await;
        assert!(report.is_clean());
        assert_eq!(
            *outcomes.lock(),
            vec![TaskOutcome::Panicked, TaskOutcome::Completed]
        );
    }

    #[tokio::test]
    async fn test_panicking_callback_does_not_kill_lane() {
        let pool = WorkerPool::new(1);
        let ran = Arc::new(AtomicUsize::new(0));

        pool.submit_with(0, async {}, |_| panic!("callback boom"))
            .unwrap();
        let counter = ran.clone();
        pool.submit(0, async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let report = pool.shutdown(Duration::from_secs(5)).await;
        assert!(report.is_clean());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panic_counts_as_fatal_drop() {
        let metrics = Arc::new(MetricsSink::new().unwrap());
        let pool = WorkerPool::with_metrics(1, metrics.clone());
        pool.submit(0, async { panic!("boom") }).unwrap();
        pool.shutdown(Duration::from_secs(5)).await;
        assert_eq!(metrics.dropped(DropReason::Fatal), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_timeout_abandons_stuck_lane() {
        let pool = WorkerPool::new(2);
        pool.submit(1, std::future::pending()).unwrap();
        pool.submit(1, async {}).unwrap();
        pool.submit(0, async {}).unwrap();

        let started = tokio::time::Instant::now();
        let report = pool.shutdown(Duration::from_secs(3)).await;

        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert!(!report.is_clean());
        assert_eq!(
            report.abandoned,
            vec![AbandonedLane {
                worker: 1,
                pending: 2
            }]
        );
        assert_eq!(report.abandoned_tasks(), 2);
    }

    #[tokio::test]
    async fn test_unknown_worker() {
        let pool = WorkerPool::new(2);
        let err = pool.submit(5, async {}).unwrap_err();
        assert!(matches!(err, PoolError::UnknownWorker { worker: 5, workers: 2 }));
    }

    #[tokio::test]
    async fn test_pending_counts_queued_tasks() {
        let pool = WorkerPool::new(1);
        let (tx, rx) = oneshot::channel::<()>();
        pool.submit(0, async move {
            let _ = rx.await;
        })
        .unwrap();
        pool.submit(0, async {}).unwrap();
        assert_eq!(pool.pending(0), 2);

        tx.send(()).unwrap();
        let report = pool.shutdown(Duration::from_secs(5)).await;
        assert!(report.is_clean());
    }
}
