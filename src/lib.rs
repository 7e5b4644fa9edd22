//! # Tributary
//!
//! A change-data-capture consumer: tails an ordered commit stream, fans
//! events out to a fixed set of sequential worker lanes keyed by business
//! identifier, folds each event into a daily aggregate with an idempotent
//! merge, and checkpoints progress per lane for at-least-once delivery.
//!
//! ## Architecture
//!
//! ```text
//! EventSource ──> StreamSupervisor ──> Router ──┬──> lane 0 ──┐
//!  (resumed at the                              ├──> lane 1 ──┼──> RetryingDispatcher
//!   oldest checkpoint)                          └──> lane N ──┘          │
//!                                                                        ├──> MergeHandler ──> AggregateStore
//!                                                                        ├──> CheckpointStore
//!                                                                        └──> TpsTracker / MetricsSink
//! ```
//!
//! ## Modules
//!
//! - [`event`]: change events, business keys, resume markers
//! - [`router`]: stable `hash(key) mod N` lane assignment
//! - [`merge`]: aggregate model and the idempotent merge
//! - [`checkpoint`]: per-lane checkpoints and resume-point selection
//! - [`store`]: Redis and in-memory storage backends
//! - [`source`]: Redis stream and in-memory change sources
//! - [`retry`]: bounded retry with failure classification
//! - [`tps`]: EWMA-smoothed throughput per lane
//! - [`metrics`]: Prometheus counters, gauges and histograms
//! - [`pool`]: the fixed pool of sequential worker lanes
//! - [`dispatch`]: what a lane does with one event
//! - [`supervisor`]: the reader loop and its lifecycle
//! - [`shutdown`]: graceful shutdown signal
//! - [`config`]: TOML configuration

pub mod checkpoint;
pub mod config;
pub mod dispatch;
pub mod event;
pub mod merge;
pub mod metrics;
pub mod pool;
pub mod retry;
pub mod router;
pub mod shutdown;
pub mod source;
pub mod store;
pub mod supervisor;
pub mod tps;

// Re-export commonly used types at crate root
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use config::TributaryConfig;
pub use dispatch::{DispatchOutcome, RetryingDispatcher};
pub use event::{BusinessKey, ChangeEvent, OperationKind, ResumeMarker, StreamPosition};
pub use merge::{Aggregate, AggregateStore, MergeError, MergeHandler, MergeOutcome, PayloadFields};
pub use metrics::{DropReason, MetricsSink};
pub use pool::{DrainReport, WorkerPool};
pub use retry::{FailureClass, RetryError, RetryPolicy};
pub use router::{Router, RoutingError};
pub use shutdown::ShutdownSignal;
pub use source::{EventSource, EventStream, SourceError};
pub use store::StorageError;
pub use supervisor::{RunSummary, StreamSupervisor, SupervisorError, SupervisorState};
pub use tps::TpsTracker;

/// Default Redis stream carrying change events
pub const DEFAULT_STREAM_NAME: &str = "tributary:changes";
