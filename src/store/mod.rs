//! Durable-store backends for checkpoints and aggregates.
//!
//! Both [`crate::checkpoint::CheckpointStore`] and
//! [`crate::merge::AggregateStore`] are implemented twice:
//!
//! - [`memory`]: mutex-guarded maps, for tests and embedding
//! - [`redis`]: Redis hashes / keys through a `deadpool-redis` pool

pub mod memory;
pub mod redis;

use deadpool_redis::redis::{ErrorKind, RedisError};
use thiserror::Error;

pub use memory::{MemoryAggregateStore, MemoryCheckpointStore};
pub use redis::{RedisAggregateStore, RedisCheckpointStore};

/// Errors raised by a durable store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Could not obtain or keep a connection
    #[error("store connection error: {0}")]
    Connection(String),

    /// The store did not answer in time
    #[error("store operation timed out: {0}")]
    Timeout(String),

    /// A conditional write lost to a concurrent writer, or the store asked us to retry
    #[error("store write conflict: {0}")]
    WriteConflict(String),

    /// The store rejected the command itself
    #[error("store command error: {0}")]
    Command(String),

    /// A stored record could not be encoded or decoded
    #[error("store serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Transient failures are worth retrying; the rest will fail the same way again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout(_) | Self::WriteConflict(_)
        )
    }
}

impl From<RedisError> for StorageError {
    fn from(e: RedisError) -> Self {
        if e.is_timeout() {
            return Self::Timeout(e.to_string());
        }
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
            return Self::Connection(e.to_string());
        }
        match e.kind() {
            ErrorKind::TryAgain
            | ErrorKind::BusyLoadingError
            | ErrorKind::ClusterDown
            | ErrorKind::MasterDown => Self::WriteConflict(e.to_string()),
            _ => Self::Command(e.to_string()),
        }
    }
}

impl From<deadpool_redis::PoolError> for StorageError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        Self::Connection(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
