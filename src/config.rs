//! Configuration module for Tributary.
//!
//! Loads configuration from TOML files with environment variable substitution.
//! Every section and field is optional; omitted values take the defaults
//! shown below.
//!
//! # Example
//!
//! ```toml
//! [redis]
//! url = "${REDIS_URL}"
//!
//! [stream]
//! name = "tributary:changes"
//! block_ms = 2000
//! batch_size = 10
//!
//! [workers]
//! count = 4
//! drain_timeout_secs = 30
//!
//! [retry]
//! max_attempts = 3
//! delay_ms = 1000
//! backoff = "fixed"        # or "exponential"
//! max_delay_ms = 32000
//!
//! [tps]
//! alpha = 0.1
//! window_secs = 900
//!
//! [checkpoint]
//! app_name = "tributary"
//! key_prefix = "tributary:checkpoints"
//!
//! [aggregate]
//! key_prefix = "tributary:daily_txns"
//!
//! [fields]
//! key = "playerID"
//! transaction_id = "transactionID"
//! value = "value"
//! date = "date"
//! name = "name"
//! ```

use crate::merge::PayloadFields;
use crate::retry::RetryPolicy;
use crate::router::Router;
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Env var naming the config file.
pub const CONFIG_PATH_ENV: &str = "TRIBUTARY_CONFIG";

/// Config file used when [`CONFIG_PATH_ENV`] is unset.
pub const DEFAULT_CONFIG_PATH: &str = "config/tributary.toml";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TributaryConfig {
    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub workers: WorkersConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub tps: TpsConfig,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    #[serde(default)]
    pub aggregate: AggregateConfig,

    /// Payload field names read by the router and the merge
    #[serde(default)]
    pub fields: PayloadFields,
}

/// Redis configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

/// Change stream configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StreamConfig {
    #[serde(default = "default_stream_name")]
    pub name: String,

    /// Longest a single read blocks waiting for new entries
    #[serde(default = "default_block_ms")]
    pub block_ms: usize,

    /// Entries fetched per read
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: default_stream_name(),
            block_ms: default_block_ms(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_stream_name() -> String {
    crate::DEFAULT_STREAM_NAME.to_string()
}

fn default_block_ms() -> usize {
    2000
}

fn default_batch_size() -> usize {
    10
}

/// Worker pool configuration
#[derive(Debug, Deserialize, Clone)]
pub struct WorkersConfig {
    /// Number of lanes; changing it reassigns keys to lanes
    #[serde(default = "default_worker_count")]
    pub count: usize,

    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

fn default_worker_count() -> usize {
    4
}

fn default_drain_timeout_secs() -> u64 {
    30
}

/// Backoff shape between retry attempts
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

/// Retry configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    /// Attempts per event, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    #[serde(default)]
    pub backoff: BackoffKind,

    /// Upper bound for exponential backoff
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
            backoff: BackoffKind::default(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    32000
}

/// Throughput tracking configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TpsConfig {
    /// EWMA smoothing factor, in (0, 1]
    #[serde(default = "default_alpha")]
    pub alpha: f64,

    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for TpsConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            window_secs: default_window_secs(),
        }
    }
}

fn default_alpha() -> f64 {
    crate::tps::DEFAULT_ALPHA
}

fn default_window_secs() -> u64 {
    crate::tps::DEFAULT_WINDOW.as_secs()
}

/// Checkpoint store configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CheckpointConfig {
    /// Stamped on every checkpoint and part of its storage key
    #[serde(default = "default_app_name")]
    pub app_name: String,

    #[serde(default = "default_checkpoint_prefix")]
    pub key_prefix: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            key_prefix: default_checkpoint_prefix(),
        }
    }
}

fn default_app_name() -> String {
    "tributary".to_string()
}

fn default_checkpoint_prefix() -> String {
    "tributary:checkpoints".to_string()
}

/// Aggregate store configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AggregateConfig {
    #[serde(default = "default_aggregate_prefix")]
    pub key_prefix: String,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_aggregate_prefix(),
        }
    }
}

fn default_aggregate_prefix() -> String {
    "tributary:daily_txns".to_string()
}

impl TributaryConfig {
    /// Load configuration from the default path or TRIBUTARY_CONFIG env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate TOML text, substituting `${VAR}` placeholders first.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content);

        debug!("Parsing TOML configuration");
        let config: TributaryConfig = toml::from_str(&content)?;

        config.validate()?;

        info!(
            workers = config.workers.count,
            stream = %config.stream.name,
            app_name = %config.checkpoint.app_name,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.redis.url.contains("${") {
            warn!(
                url = %self.redis.url,
                "Redis URL contains unsubstituted environment variable"
            );
        }
        if !self.redis.url.starts_with("redis://") && !self.redis.url.starts_with("rediss://") {
            return invalid("Redis URL must start with redis:// or rediss://".to_string());
        }

        if self.stream.name.is_empty() {
            return invalid("stream name must not be empty".to_string());
        }

        if self.workers.count == 0 {
            return invalid("worker count must be at least 1".to_string());
        }

        if self.retry.max_attempts == 0 {
            return invalid("retry max_attempts must be at least 1".to_string());
        }

        // NaN fails this check too
        if !(self.tps.alpha > 0.0 && self.tps.alpha <= 1.0) {
            return invalid(format!("tps alpha must be in (0, 1], got {}", self.tps.alpha));
        }

        if self.tps.window_secs == 0 {
            return invalid("tps window_secs must be at least 1".to_string());
        }

        if self.checkpoint.app_name.is_empty() {
            return invalid("checkpoint app_name must not be empty".to_string());
        }

        for (setting, field) in self.fields.all() {
            if field.is_empty() {
                return invalid(format!("fields.{setting} must not be empty"));
            }
        }

        Ok(())
    }

    /// Retry policy described by `[retry]`.
    pub fn retry_policy(&self) -> RetryPolicy {
        let delay = Duration::from_millis(self.retry.delay_ms);
        match self.retry.backoff {
            BackoffKind::Fixed => RetryPolicy::fixed(self.retry.max_attempts, delay),
            BackoffKind::Exponential => RetryPolicy::exponential(
                self.retry.max_attempts,
                delay,
                Duration::from_millis(self.retry.max_delay_ms),
            ),
        }
    }

    /// Router over `[workers] count` lanes keyed by `[fields] key`.
    pub fn build_router(&self) -> Router {
        Router::new(self.workers.count, self.fields.key.clone())
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.workers.drain_timeout_secs)
    }

    pub fn tps_window(&self) -> Duration {
        Duration::from_secs(self.tps.window_secs)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid");

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                caps[0].to_string()
            }
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Backoff;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TRIBUTARY_TEST_REDIS", "redis://cache:6380");
        let input = "url = \"${TRIBUTARY_TEST_REDIS}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "url = \"redis://cache:6380\"");
        env::remove_var("TRIBUTARY_TEST_REDIS");
    }

    #[test]
    fn test_env_var_not_set() {
        let input = "url = \"${NONEXISTENT_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "url = \"${NONEXISTENT_VAR}\"");
    }

    #[test]
    fn test_default_config() {
        let config = TributaryConfig::default();
        assert_eq!(config.redis.url, "redis://localhost:6379");
        assert_eq!(config.stream.name, "tributary:changes");
        assert_eq!(config.workers.count, 4);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.backoff, BackoffKind::Fixed);
        assert_eq!(config.tps.alpha, 0.1);
        assert_eq!(config.tps_window(), Duration::from_secs(900));
        assert_eq!(config.drain_timeout(), Duration::from_secs(30));
        assert_eq!(config.fields.key, "playerID");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_config() {
        let config = TributaryConfig::parse(
            r#"
            [workers]
            count = 8

            [fields]
            key = "accountID"
        "#,
        )
        .unwrap();

        assert_eq!(config.workers.count, 8);
        assert_eq!(config.workers.drain_timeout_secs, 30);
        assert_eq!(config.fields.key, "accountID");
        assert_eq!(config.fields.transaction_id, "transactionID");

        let router = config.build_router();
        assert_eq!(router.workers(), 8);
        assert_eq!(router.key_field(), "accountID");
    }

    #[test]
    fn test_retry_policy_from_config() {
        let config = TributaryConfig::parse(
            r#"
            [retry]
            max_attempts = 5
            delay_ms = 200
            backoff = "exponential"
            max_delay_ms = 1000
        "#,
        )
        .unwrap();

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(
            policy.backoff(),
            Backoff::Exponential {
                max: Duration::from_secs(1)
            }
        );
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(5), Duration::from_secs(1));
    }

    #[test]
    fn test_unknown_backoff_is_a_parse_error() {
        let result = TributaryConfig::parse("[retry]\nbackoff = \"random\"\n");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        for toml in [
            "[workers]\ncount = 0\n",
            "[retry]\nmax_attempts = 0\n",
            "[tps]\nalpha = 0.0\n",
            "[tps]\nalpha = 1.5\n",
            "[tps]\nwindow_secs = 0\n",
            "[fields]\nname = \"\"\n",
            "[redis]\nurl = \"http://localhost\"\n",
            "[checkpoint]\napp_name = \"\"\n",
        ] {
            let result = TributaryConfig::parse(toml);
            assert!(
                matches!(result, Err(ConfigError::ValidationError(_))),
                "accepted: {toml}"
            );
        }
    }

    #[test]
    fn test_alpha_of_one_is_allowed() {
        assert!(TributaryConfig::parse("[tps]\nalpha = 1.0\n").is_ok());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = TributaryConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config.workers.count, 4);
    }
}
