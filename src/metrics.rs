//! Processing metrics.
//!
//! [`MetricsSink`] owns its own `prometheus` [`Registry`]; nothing is
//! registered globally. One sink is built at startup and shared by every
//! worker behind an `Arc`. All collectors are atomic, so workers update them
//! concurrently without coordination.
//!
//! # Exposed series
//!
//! ```text
//! total_events_handled                                counter
//! total_events_handled_successfully                   counter
//! total_events_dropped{reason}                        counter
//! event_lag_seconds{worker}                           gauge
//! tps_per_thread{worker}                              gauge
//! event_process_duration_seconds                      histogram
//! p99_processing_time_milliseconds{quantile="0.99"}   gauge
//! ```
//!
//! [`MetricsSink::render`] produces the text exposition format for whatever
//! scrape endpoint embeds the crate.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;

/// Histogram buckets for `event_process_duration_seconds`.
pub const DURATION_BUCKETS: [f64; 8] = [0.0, 0.05, 0.1, 0.2, 0.5, 0.7, 1.0, 2.0];

/// Recent durations kept for the p99 estimate.
const P99_WINDOW: usize = 1024;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metrics registry error: {0}")]
    Registry(#[from] prometheus::Error),

    #[error("metrics exposition is not UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// Why an event left the pipeline without a successful merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// No usable business key
    Routing,
    /// Required payload fields missing or malformed
    InvalidDocument,
    /// Transient failures outlasted the retry budget
    RetriesExhausted,
    /// A non-retryable storage failure, or a panic in the handler
    Fatal,
    /// The worker lane was already closed
    RejectedByPool,
}

impl DropReason {
    pub const ALL: [DropReason; 5] = [
        Self::Routing,
        Self::InvalidDocument,
        Self::RetriesExhausted,
        Self::Fatal,
        Self::RejectedByPool,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Routing => "routing",
            Self::InvalidDocument => "invalid_document",
            Self::RetriesExhausted => "retries_exhausted",
            Self::Fatal => "fatal",
            Self::RejectedByPool => "rejected_by_pool",
        }
    }
}

/// Counters, gauges and distributions for the pipeline.
pub struct MetricsSink {
    registry: Registry,
    handled: IntCounter,
    succeeded: IntCounter,
    dropped: IntCounterVec,
    lag_seconds: GaugeVec,
    tps: GaugeVec,
    duration: Histogram,
    p99_millis: GaugeVec,
    recent_millis: Mutex<VecDeque<f64>>,
}

impl MetricsSink {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let handled = IntCounter::with_opts(Opts::new(
            "total_events_handled",
            "Change events received by a worker",
        ))?;
        let succeeded = IntCounter::with_opts(Opts::new(
            "total_events_handled_successfully",
            "Change events merged and checkpointed",
        ))?;
        let dropped = IntCounterVec::new(
            Opts::new("total_events_dropped", "Change events dropped, by reason"),
            &["reason"],
        )?;
        let lag_seconds = GaugeVec::new(
            Opts::new(
                "event_lag_seconds",
                "Wall clock minus cluster time of the last event seen by each worker",
            ),
            &["worker"],
        )?;
        let tps = GaugeVec::new(
            Opts::new("tps_per_thread", "EWMA-smoothed events per second per worker"),
            &["worker"],
        )?;
        let duration = Histogram::with_opts(
            HistogramOpts::new(
                "event_process_duration_seconds",
                "Duration of one merge and checkpoint attempt",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
        )?;
        // Exposed as a gauge with a `quantile` label, not a summary: the
        // client has no summary type, so there is no `_sum` or `_count`.
        // The value is the p99 over the last P99_WINDOW attempts, refreshed on render.
        let p99_millis = GaugeVec::new(
            Opts::new(
                "p99_processing_time_milliseconds",
                "99th percentile of recent processing attempts (gauge, no _sum/_count)",
            ),
            &["quantile"],
        )?;

        registry.register(Box::new(handled.clone()))?;
        registry.register(Box::new(succeeded.clone()))?;
        registry.register(Box::new(dropped.clone()))?;
        registry.register(Box::new(lag_seconds.clone()))?;
        registry.register(Box::new(tps.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(p99_millis.clone()))?;

        // Every reason shows up at zero from the first scrape
        for reason in DropReason::ALL {
            dropped.with_label_values(&[reason.as_str()]);
        }

        Ok(Self {
            registry,
            handled,
            succeeded,
            dropped,
            lag_seconds,
            tps,
            duration,
            p99_millis,
            recent_millis: Mutex::new(VecDeque::with_capacity(P99_WINDOW)),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// An event reached its worker.
    pub fn record_handled(&self) {
        self.handled.inc();
    }

    /// An event was merged and checkpointed.
    pub fn record_success(&self) {
        self.succeeded.inc();
    }

    pub fn record_dropped(&self, reason: DropReason) {
        self.dropped.with_label_values(&[reason.as_str()]).inc();
    }

    /// Set `worker`'s lag from the event's cluster time; returns the lag in seconds.
    pub fn record_lag(&self, worker: usize, cluster_timestamp: DateTime<Utc>) -> f64 {
        self.record_lag_at(worker, cluster_timestamp, Utc::now())
    }

    pub fn record_lag_at(
        &self,
        worker: usize,
        cluster_timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> f64 {
        let lag = (now - cluster_timestamp).num_milliseconds() as f64 / 1000.0;
        self.lag_seconds
            .with_label_values(&[&worker.to_string()])
            .set(lag);
        lag
    }

    pub fn record_tps(&self, worker: usize, tps: f64) {
        self.tps.with_label_values(&[&worker.to_string()]).set(tps);
    }

    /// Observe one processing attempt.
    pub fn observe_duration(&self, elapsed: Duration) {
        self.duration.observe(elapsed.as_secs_f64());

        let mut recent = self.recent_millis.lock();
        if recent.len() == P99_WINDOW {
            recent.pop_front();
        }
        recent.push_back(elapsed.as_secs_f64() * 1000.0);
    }

    /// 99th percentile of the recent attempt durations, in milliseconds.
    pub fn p99_millis(&self) -> f64 {
        let mut samples: Vec<f64> = self.recent_millis.lock().iter().copied().collect();
        if samples.is_empty() {
            return 0.0;
        }
        samples.sort_by(|a, b| a.total_cmp(b));
        let rank = ((samples.len() as f64) * 0.99).ceil() as usize;
        samples[rank.clamp(1, samples.len()) - 1]
    }

    /// Text exposition of every series.
    pub fn render(&self) -> Result<String, MetricsError> {
        self.p99_millis
            .with_label_values(&["0.99"])
            .set(self.p99_millis());

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub fn total_handled(&self) -> u64 {
        self.handled.get()
    }

    pub fn total_succeeded(&self) -> u64 {
        self.succeeded.get()
    }

    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.dropped.with_label_values(&[reason.as_str()]).get()
    }

    pub fn lag_seconds(&self, worker: usize) -> f64 {
        self.lag_seconds
            .with_label_values(&[&worker.to_string()])
            .get()
    }

    pub fn tps(&self, worker: usize) -> f64 {
        self.tps.with_label_values(&[&worker.to_string()]).get()
    }

    /// Number of duration observations so far.
    pub fn duration_samples(&self) -> u64 {
        self.duration.get_sample_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_counters() {
        let metrics = MetricsSink::new().unwrap();
        metrics.record_handled();
        metrics.record_handled();
        metrics.record_success();
        metrics.record_dropped(DropReason::InvalidDocument);

        assert_eq!(metrics.total_handled(), 2);
        assert_eq!(metrics.total_succeeded(), 1);
        assert_eq!(metrics.dropped(DropReason::InvalidDocument), 1);
        assert_eq!(metrics.dropped(DropReason::Routing), 0);
    }

    #[test]
    fn test_lag_is_per_worker() {
        let metrics = MetricsSink::new().unwrap();
        let event_time = Utc.timestamp_opt(1_000, 0).unwrap();
        let now = Utc.timestamp_opt(1_002, 500_000_000).unwrap();

        assert_eq!(metrics.record_lag_at(3, event_time, now), 2.5);
        assert_eq!(metrics.lag_seconds(3), 2.5);
        assert_eq!(metrics.lag_seconds(0), 0.0);
    }

    #[test]
    fn test_p99() {
        let metrics = MetricsSink::new().unwrap();
        assert_eq!(metrics.p99_millis(), 0.0);

        for ms in 1..=100 {
            metrics.observe_duration(Duration::from_millis(ms));
        }
        assert!((metrics.p99_millis() - 99.0).abs() < 1e-9);
        assert_eq!(metrics.duration_samples(), 100);
    }

    #[test]
    fn test_p99_window_is_bounded() {
        let metrics = MetricsSink::new().unwrap();
        for _ in 0..P99_WINDOW {
            metrics.observe_duration(Duration::from_secs(10));
        }
        for _ in 0..P99_WINDOW {
            metrics.observe_duration(Duration::from_millis(1));
        }
        assert!((metrics.p99_millis() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_render_exposes_names() {
        let metrics = MetricsSink::new().unwrap();
        metrics.record_handled();
        metrics.record_tps(1, 0.25);
        metrics.record_lag(1, Utc::now());
        metrics.observe_duration(Duration::from_millis(30));

        let text = metrics.render().unwrap();
        for name in [
            "total_events_handled",
            "total_events_handled_successfully",
            "total_events_dropped{reason=\"routing\"}",
            "event_lag_seconds{worker=\"1\"}",
            "tps_per_thread{worker=\"1\"} 0.25",
            "event_process_duration_seconds_bucket{le=\"0.05\"} 1",
            "p99_processing_time_milliseconds{quantile=\"0.99\"}",
        ] {
            assert!(text.contains(name), "missing {name} in:\n{text}");
        }
    }

    #[test]
    fn test_p99_is_exposed_as_gauge() {
        let metrics = MetricsSink::new().unwrap();
        metrics.observe_duration(Duration::from_millis(30));

        let text = metrics.render().unwrap();
        assert!(text.contains("# TYPE p99_processing_time_milliseconds gauge"));
        assert!(!text.contains("p99_processing_time_milliseconds_count"));
    }

    #[test]
    fn test_sinks_do_not_share_state() {
        let a = MetricsSink::new().unwrap();
        let b = MetricsSink::new().unwrap();
        a.record_handled();
        assert_eq!(b.total_handled(), 0);
    }
}
