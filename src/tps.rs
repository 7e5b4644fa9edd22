//! Per-worker throughput tracking.
//!
//! Each lane keeps the timestamps of the events it recorded inside a
//! trailing window (15 minutes by default). Every [`TpsTracker::record_event`]
//! prunes the window, takes the instantaneous rate
//! `count_in_window / window_seconds`, and folds it into an EWMA:
//!
//! ```text
//! smoothed = alpha * instantaneous + (1 - alpha) * previous
//! ```
//!
//! The smoothed value only changes when an event is recorded. Reading it
//! with [`TpsTracker::calculate_tps`] never recomputes anything.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default trailing window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Default EWMA smoothing factor.
pub const DEFAULT_ALPHA: f64 = 0.1;

#[derive(Debug, Default)]
struct Lane {
    timestamps: VecDeque<Instant>,
    smoothed: f64,
}

/// EWMA-smoothed events-per-second, one independent lane per worker.
#[derive(Debug)]
pub struct TpsTracker {
    window: Duration,
    alpha: f64,
    lanes: Vec<Mutex<Lane>>,
}

impl TpsTracker {
    /// Track `workers` lanes.
    ///
    /// `alpha` is clamped into `(0, 1]`; configuration validation rejects
    /// anything outside that range before it gets here.
    pub fn new(workers: usize, window: Duration, alpha: f64) -> Self {
        Self {
            window,
            alpha: alpha.clamp(f64::MIN_POSITIVE, 1.0),
            lanes: (0..workers).map(|_| Mutex::new(Lane::default())).collect(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Record one event for `worker` now; returns the new smoothed rate.
    pub fn record_event(&self, worker: usize) -> f64 {
        self.record_event_at(worker, Instant::now())
    }

    /// Record one event for `worker` at `now`; returns the new smoothed rate.
    ///
    /// Unknown workers are ignored and report 0.
    pub fn record_event_at(&self, worker: usize, now: Instant) -> f64 {
        let Some(lane) = self.lanes.get(worker) else {
            return 0.0;
        };
        let mut lane = lane.lock();

        lane.timestamps.push_back(now);
        if let Some(cutoff) = now.checked_sub(self.window) {
            while lane.timestamps.front().is_some_and(|ts| *ts < cutoff) {
                lane.timestamps.pop_front();
            }
        }

        let instantaneous = lane.timestamps.len() as f64 / self.window.as_secs_f64();
        lane.smoothed = self.alpha * instantaneous + (1.0 - self.alpha) * lane.smoothed;
        lane.smoothed
    }

    /// Last smoothed rate for `worker`, 0 if nothing was recorded.
    pub fn calculate_tps(&self, worker: usize) -> f64 {
        self.lanes
            .get(worker)
            .map(|lane| lane.lock().smoothed)
            .unwrap_or(0.0)
    }

    /// Events currently inside `worker`'s window, as of the last recording.
    pub fn events_in_window(&self, worker: usize) -> usize {
        self.lanes
            .get(worker)
            .map(|lane| lane.lock().timestamps.len())
            .unwrap_or(0)
    }
}
