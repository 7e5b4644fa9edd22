//! Top-level stream loop.
//!
//! ```text
//!  INIT ──> RESUMING ──> STREAMING ──> DRAINING ──> STOPPED
//!              │             │
//!              └─ startup ───┴──────────────────────> STOPPED (error)
//!                 failure
//! ```
//!
//! - **RESUMING**: load the oldest checkpoint (retried under the policy) and
//!   open the source after it, or at the current end on a fresh start.
//! - **STREAMING**: read one event at a time; route it by business key and
//!   hand it to that key's worker lane. The reader never waits on a worker.
//!   Shutdown is checked between reads and while a read is blocked.
//! - **DRAINING**: stop reading, close the lanes, wait up to the drain
//!   timeout, abandon whatever is left.
//!
//! Only the two startup steps can fail the run. Anything that goes wrong with
//! a single event is logged, counted, and skipped.

use crate::checkpoint::CheckpointStore;
use crate::dispatch::RetryingDispatcher;
use crate::event::{ChangeEvent, ResumeMarker};
use crate::metrics::DropReason;
use crate::pool::{DrainReport, WorkerPool};
use crate::retry::FailureClass;
use crate::router::Router;
use crate::shutdown::ShutdownSignal;
use crate::source::{EventSource, EventStream, SourceError};
use crate::store::StorageError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Pause before reading again after a transport error.
const DEFAULT_TRANSPORT_BACKOFF: Duration = Duration::from_secs(1);

/// Supervisor lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SupervisorState {
    Init,
    Resuming,
    Streaming,
    Draining,
    Stopped,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "INIT",
            Self::Resuming => "RESUMING",
            Self::Streaming => "STREAMING",
            Self::Draining => "DRAINING",
            Self::Stopped => "STOPPED",
        })
    }
}

/// Startup failures; the only errors that end a run.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("cannot resolve resume position: {0}")]
    Resume(#[source] StorageError),

    #[error("cannot open change stream: {0}")]
    OpenStream(#[source] SourceError),
}

/// What a completed run did.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub resumed_from: Option<ResumeMarker>,
    pub events_read: u64,
    pub events_dispatched: u64,
    pub unroutable: u64,
    pub malformed: u64,
    pub transport_errors: u64,
    pub drain: DrainReport,
}

/// Reads the change stream and fans events out to worker lanes.
pub struct StreamSupervisor {
    source: Arc<dyn EventSource>,
    checkpoints: Arc<dyn CheckpointStore>,
    router: Router,
    dispatcher: Arc<RetryingDispatcher>,
    drain_timeout: Duration,
    transport_backoff: Duration,
    state: watch::Sender<SupervisorState>,
}

impl StreamSupervisor {
    pub fn new(
        source: Arc<dyn EventSource>,
        checkpoints: Arc<dyn CheckpointStore>,
        router: Router,
        dispatcher: Arc<RetryingDispatcher>,
        drain_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::Init);
        Self {
            source,
            checkpoints,
            router,
            dispatcher,
            drain_timeout,
            transport_backoff: DEFAULT_TRANSPORT_BACKOFF,
            state,
        }
    }

    /// Override the pause after a transport error.
    pub fn with_transport_backoff(mut self, backoff: Duration) -> Self {
        self.transport_backoff = backoff;
        self
    }

    /// Observe state transitions.
    pub fn state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    fn transition(&self, next: SupervisorState) {
        let previous = self.state.send_replace(next);
        info!(from = %previous, to = %next, "Supervisor state change");
    }

    /// Run until the stream ends or `shutdown` fires, then drain.
    pub async fn run(self, shutdown: ShutdownSignal) -> Result<RunSummary, SupervisorError> {
        self.transition(SupervisorState::Resuming);

        let resumed_from = match self.resolve_resume().await {
            Ok(marker) => marker,
            Err(e) => {
                error!(error = %e, "Startup failed");
                self.transition(SupervisorState::Stopped);
                return Err(e);
            }
        };
        let mut stream = match self.source.open(resumed_from.as_ref()).await {
            Ok(stream) => stream,
            Err(e) => {
                let e = SupervisorError::OpenStream(e);
                error!(error = %e, "Startup failed");
                self.transition(SupervisorState::Stopped);
                return Err(e);
            }
        };

        let mut summary = RunSummary {
            resumed_from,
            ..RunSummary::default()
        };
        let pool = WorkerPool::with_metrics(
            self.router.workers(),
            Arc::clone(self.dispatcher.metrics()),
        );

        self.transition(SupervisorState::Streaming);
        self.stream_loop(stream.as_mut(), &pool, &shutdown, &mut summary)
            .await;

        self.transition(SupervisorState::Draining);
        drop(stream);
        summary.drain = pool.shutdown(self.drain_timeout).await;
        if !summary.drain.is_clean() {
            warn!(
                abandoned_lanes = summary.drain.abandoned.len(),
                abandoned_tasks = summary.drain.abandoned_tasks(),
                timeout_secs = self.drain_timeout.as_secs(),
                "Shutdown timeout: workers cancelled with work outstanding"
            );
        }

        self.transition(SupervisorState::Stopped);
        info!(
            events_read = summary.events_read,
            events_dispatched = summary.events_dispatched,
            unroutable = summary.unroutable,
            malformed = summary.malformed,
            "Supervisor stopped"
        );
        Ok(summary)
    }

    async fn resolve_resume(&self) -> Result<Option<ResumeMarker>, SupervisorError> {
        let classify = |e: &StorageError| {
            if e.is_transient() {
                FailureClass::Transient
            } else {
                FailureClass::Fatal
            }
        };
        let resume = self
            .dispatcher
            .policy()
            .run(classify, |_| self.checkpoints.load_resume_position())
            .await
            .map_err(|e| SupervisorError::Resume(e.into_inner()))?;
        Ok(resume.map(|cp| cp.resume_marker))
    }

    async fn stream_loop(
        &self,
        stream: &mut dyn EventStream,
        pool: &WorkerPool,
        shutdown: &ShutdownSignal,
        summary: &mut RunSummary,
    ) {
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, no longer reading events");
                    return;
                }
                next = stream.next_event() => next,
            };

            match next {
                Ok(Some(event)) => {
                    summary.events_read += 1;
                    self.dispatch(pool, event, summary);
                }
                Ok(None) => {
                    info!("Change stream ended");
                    return;
                }
                Err(e) if e.is_malformed() => {
                    summary.malformed += 1;
                    warn!(error = %e, "Skipping malformed stream entry");
                }
                Err(e) => {
                    summary.transport_errors += 1;
                    warn!(
                        error = %e,
                        backoff_ms = self.transport_backoff.as_millis() as u64,
                        "Stream read failed, backing off"
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(self.transport_backoff) => {}
                    }
                }
            }
        }
    }

    fn dispatch(&self, pool: &WorkerPool, event: ChangeEvent, summary: &mut RunSummary) {
        let metrics = self.dispatcher.metrics();
        let worker = match self.router.route_event(&event) {
            Ok((key, worker)) => {
                debug!(key = %key, worker = worker, position = %event.commit_position, "Routed event");
                worker
            }
            Err(e) => {
                summary.unroutable += 1;
                metrics.record_dropped(DropReason::Routing);
                warn!(error = %e, "Dropping unroutable event");
                return;
            }
        };

        let dispatcher = Arc::clone(&self.dispatcher);
        let position = event.commit_position.clone();
        let submitted = pool.submit(worker, async move {
            dispatcher.process(worker, &event).await;
        });
        match submitted {
            Ok(()) => summary.events_dispatched += 1,
            Err(e) => {
                metrics.record_dropped(DropReason::RejectedByPool);
                error!(worker = worker, position = %position, error = %e, "Worker rejected event");
            }
        }
    }
}
