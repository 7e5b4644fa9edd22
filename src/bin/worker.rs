//! Tributary Worker - CDC Consumer
//!
//! The worker tails the change stream in Redis, fans events out to worker
//! lanes by business key, merges them into daily aggregates, and checkpoints
//! each lane's progress so a restart resumes without losing events.
//!
//! ## Configuration
//!
//! - `TRIBUTARY_CONFIG`: path to the TOML config (default: `config/tributary.toml`)
//! - `REDIS_URL`: overrides `[redis] url` when set
//! - `RUST_LOG`: logging level (default: "info")

use deadpool_redis::{Config, Runtime};
use std::env;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tributary::config::TributaryConfig;
use tributary::dispatch::RetryingDispatcher;
use tributary::merge::MergeHandler;
use tributary::metrics::MetricsSink;
use tributary::shutdown::ShutdownSignal;
use tributary::source::RedisStreamSource;
use tributary::store::{RedisAggregateStore, RedisCheckpointStore};
use tributary::supervisor::StreamSupervisor;
use tributary::tps::TpsTracker;

/// Load configuration, letting `REDIS_URL` override the file.
fn load_config() -> Result<TributaryConfig, Box<dyn std::error::Error>> {
    let mut config = TributaryConfig::load()?;
    if let Ok(url) = env::var("REDIS_URL") {
        config.redis.url = url;
        config.validate()?;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config().map_err(|e| {
        error!(error = %e, "Invalid configuration");
        e
    })?;

    info!(
        stream = %config.stream.name,
        workers = config.workers.count,
        app_name = %config.checkpoint.app_name,
        "Tributary worker starting"
    );

    // Create Redis connection pool
    let pool = Config::from_url(config.redis.url.clone()).create_pool(Some(Runtime::Tokio1))?;

    let checkpoints = Arc::new(RedisCheckpointStore::new(
        pool.clone(),
        &config.checkpoint.key_prefix,
        &config.checkpoint.app_name,
    ));
    let aggregates = Arc::new(RedisAggregateStore::new(
        pool.clone(),
        config.aggregate.key_prefix.clone(),
    ));
    let source = Arc::new(RedisStreamSource::new(
        pool,
        config.stream.name.clone(),
        config.stream.block_ms,
        config.stream.batch_size,
    ));

    let metrics = Arc::new(MetricsSink::new()?);
    let tps = Arc::new(TpsTracker::new(
        config.workers.count,
        config.tps_window(),
        config.tps.alpha,
    ));
    let dispatcher = Arc::new(RetryingDispatcher::new(
        MergeHandler::new(aggregates, config.fields.clone()),
        checkpoints.clone(),
        metrics.clone(),
        tps,
        config.retry_policy(),
        config.checkpoint.app_name.clone(),
    ));

    let supervisor = StreamSupervisor::new(
        source,
        checkpoints,
        config.build_router(),
        dispatcher,
        config.drain_timeout(),
    );

    // Setup graceful shutdown
    let shutdown = ShutdownSignal::new();
    let listener = shutdown.clone();
    tokio::spawn(async move { listener.wait().await });

    let summary = supervisor.run(shutdown).await?;

    if !summary.drain.is_clean() {
        warn!(
            abandoned_tasks = summary.drain.abandoned_tasks(),
            "Some events were not processed before shutdown; they will be redelivered"
        );
    }
    info!(
        resumed_from = ?summary.resumed_from,
        events_read = summary.events_read,
        events_dispatched = summary.events_dispatched,
        handled = metrics.total_handled(),
        succeeded = metrics.total_succeeded(),
        "Worker shutdown complete"
    );
    Ok(())
}
