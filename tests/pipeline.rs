//! End-to-end runs of the supervisor over the in-memory backends.

use chrono::{NaiveDate, TimeZone, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use tributary::config::TributaryConfig;
use tributary::source::MemorySource;
use tributary::store::{MemoryAggregateStore, MemoryCheckpointStore};
use tributary::tps::TpsTracker;
use tributary::{
    AggregateStore, BusinessKey, ChangeEvent, CheckpointStore, DropReason, MergeHandler,
    MetricsSink, OperationKind, RetryPolicy, RetryingDispatcher, Router, ShutdownSignal,
    StreamSupervisor,
};

const WORKERS: usize = 4;

struct Pipeline {
    checkpoints: Arc<MemoryCheckpointStore>,
    aggregates: Arc<MemoryAggregateStore>,
}

impl Pipeline {
    fn new() -> Self {
        Self {
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            aggregates: Arc::new(MemoryAggregateStore::new()),
        }
    }

    /// One process lifetime: build everything, run to end of stream.
    async fn run(&self, source: Arc<MemorySource>) -> (tributary::RunSummary, Arc<MetricsSink>) {
        let metrics = Arc::new(MetricsSink::new().unwrap());
        let config = TributaryConfig::default();
        let dispatcher = Arc::new(RetryingDispatcher::new(
            MergeHandler::new(self.aggregates.clone(), config.fields.clone()),
            self.checkpoints.clone(),
            metrics.clone(),
            Arc::new(TpsTracker::new(WORKERS, config.tps_window(), config.tps.alpha)),
            RetryPolicy::fixed(3, Duration::from_millis(5)),
            "pipeline-test",
        ));
        let supervisor = StreamSupervisor::new(
            source,
            self.checkpoints.clone(),
            Router::new(WORKERS, "playerID"),
            dispatcher,
            Duration::from_secs(10),
        );
        let summary = supervisor.run(ShutdownSignal::new()).await.unwrap();
        (summary, metrics)
    }
}

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
}

/// Event number `seq`, committed at second `seq`.
fn txn(seq: i64, player: i64, transaction: i64, value: f64) -> ChangeEvent {
    ChangeEvent::from_json(
        format!("{seq}-0"),
        Utc.timestamp_opt(1_709_280_000 + seq, 0).unwrap(),
        OperationKind::Insert,
        json!({
            "playerID": player,
            "transactionID": transaction,
            "value": value,
            "date": {"$date": "2024-03-01T08:00:00Z"},
            "name": format!("player-{player}")
        }),
    )
}

fn workload() -> Vec<ChangeEvent> {
    let mut events = Vec::new();
    let mut seq = 0;
    for round in 0..5 {
        for player in 0..10 {
            seq += 1;
            // transaction 1 is rewritten every round; the rest are new
            events.push(txn(seq, player, 1, round as f64));
            seq += 1;
            events.push(txn(seq, player, 100 + round, 1.0));
        }
    }
    events
}

#[tokio::test]
async fn test_full_run_builds_aggregates_in_key_order() {
    let pipeline = Pipeline::new();
    let source = Arc::new(MemorySource::new(workload()));

    let (summary, metrics) = pipeline.run(source).await;

    assert_eq!(summary.events_read, 100);
    assert_eq!(summary.events_dispatched, 100);
    assert!(summary.drain.is_clean());
    assert_eq!(metrics.total_handled(), 100);
    assert_eq!(metrics.total_succeeded(), 100);

    assert_eq!(pipeline.aggregates.len(), 10);
    for player in 0..10 {
        let aggregate = pipeline
            .aggregates
            .get(&BusinessKey::Int(player), day())
            .await
            .unwrap()
            .unwrap();
        // transaction 1 plus one new transaction per round
        assert_eq!(aggregate.transactions.len(), 6);
        // per-key FIFO: the last rewrite wins
        assert_eq!(aggregate.transaction(1).unwrap().value, 4.0);
        assert_eq!(aggregate.name.as_deref(), Some(format!("player-{player}").as_str()));
    }

    // each lane that saw work checkpointed its last event
    let checkpoints = pipeline.checkpoints.load_all().await.unwrap();
    assert!(!checkpoints.is_empty());
    assert!(checkpoints.len() <= WORKERS);
    assert!(checkpoints.iter().all(|cp| cp.app_name == "pipeline-test"));
}

#[tokio::test]
async fn test_restart_resumes_from_oldest_lane_and_converges() {
    let pipeline = Pipeline::new();
    let events = workload();

    let (_, _) = pipeline.run(Arc::new(MemorySource::new(events.clone()))).await;
    let before = {
        let mut all = pipeline.aggregates.snapshot();
        all.sort_by_key(|a| a.business_key.to_string());
        all
    };
    let resume = pipeline
        .checkpoints
        .load_resume_position()
        .await
        .unwrap()
        .unwrap();

    // Same history plus two new events
    let mut extended = events;
    extended.push(txn(101, 3, 1, 99.0));
    extended.push(txn(102, 42, 7, 5.0));
    let source = Arc::new(MemorySource::new(extended));

    let (summary, _) = pipeline.run(source.clone()).await;

    assert_eq!(source.opened_at(), vec![Some(resume.resume_marker.clone())]);
    assert_eq!(summary.resumed_from, Some(resume.resume_marker));
    assert!(summary.events_read >= 2);

    assert_eq!(pipeline.aggregates.len(), 11);
    let player3 = pipeline
        .aggregates
        .get(&BusinessKey::Int(3), day())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(player3.transactions.len(), 6);
    assert_eq!(player3.transaction(1).unwrap().value, 99.0);

    // Redelivered events did not duplicate anything for untouched keys
    for aggregate in before.iter().filter(|a| a.business_key != BusinessKey::Int(3)) {
        let now = pipeline
            .aggregates
            .get(&aggregate.business_key, aggregate.bucket_date)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(now.transactions, aggregate.transactions);
        assert_eq!(now.name, aggregate.name);
    }
}

#[tokio::test]
async fn test_bad_events_never_stop_the_stream() {
    let pipeline = Pipeline::new();
    let no_key = ChangeEvent::from_json(
        "2-0",
        Utc::now(),
        OperationKind::Update,
        json!({"transactionID": 1}),
    );
    let no_date = ChangeEvent::from_json(
        "3-0",
        Utc::now(),
        OperationKind::Other("replace".into()),
        json!({"playerID": 8, "transactionID": 1, "value": 1.0, "name": "x"}),
    );
    let source = Arc::new(
        MemorySource::new(vec![txn(1, 1, 1, 1.0), no_key, no_date, txn(4, 2, 1, 1.0)])
            .with_malformed("5-0", "payload is not JSON"),
    );

    let (summary, metrics) = pipeline.run(source).await;

    assert_eq!(summary.events_read, 4);
    assert_eq!(summary.unroutable, 1);
    assert_eq!(summary.malformed, 1);
    assert_eq!(metrics.dropped(DropReason::Routing), 1);
    assert_eq!(metrics.dropped(DropReason::InvalidDocument), 1);
    assert_eq!(metrics.total_handled(), 3);
    assert_eq!(metrics.total_succeeded(), 2);
    assert_eq!(pipeline.aggregates.len(), 2);

    let exposition = metrics.render().unwrap();
    assert!(exposition.contains("total_events_dropped{reason=\"invalid_document\"} 1"));
}

#[test]
fn test_sample_config_matches_defaults() {
    let config = TributaryConfig::load_from("config/tributary.toml").unwrap();
    let defaults = TributaryConfig::default();

    assert_eq!(config.workers.count, defaults.workers.count);
    assert_eq!(config.stream.name, defaults.stream.name);
    assert_eq!(config.retry.max_attempts, defaults.retry.max_attempts);
    assert_eq!(config.tps.window_secs, defaults.tps.window_secs);
    assert_eq!(config.fields, defaults.fields);
}
