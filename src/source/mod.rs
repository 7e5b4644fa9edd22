//! Change-stream sources.
//!
//! An [`EventSource`] opens an [`EventStream`] at a resume position. The
//! stream is read by exactly one task, the supervisor's reader loop, so
//! [`EventStream::next_event`] takes `&mut self` and may block for as long as
//! the source has nothing new.
//!
//! ```text
//! open(None)        -> events written after the open
//! open(Some(m))     -> events strictly after the one that carried `m`
//! next_event()      -> Ok(Some(event)) | Ok(None) (stream ended) | Err(_)
//! ```
//!
//! Backends:
//!
//! - [`memory`]: a scripted list of events
//! - [`redis`]: a Redis stream read with `XREAD BLOCK`

pub mod memory;
pub mod redis;

use crate::event::{ChangeEvent, ResumeMarker};
use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemorySource;
pub use redis::RedisStreamSource;

/// Errors raised while opening or reading a stream.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// The transport failed; reading again from the same position may succeed
    #[error("source transport error: {0}")]
    Transport(String),

    /// One entry could not be decoded; the stream has moved past it
    #[error("malformed entry {position}: {reason}")]
    Malformed { position: String, reason: String },
}

impl SourceError {
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }
}

impl From<deadpool_redis::redis::RedisError> for SourceError {
    fn from(e: deadpool_redis::redis::RedisError) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<deadpool_redis::PoolError> for SourceError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Something that can be tailed from a resume position.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Open a stream after `resume`, or at the current end when `None`.
    async fn open(&self, resume: Option<&ResumeMarker>) -> Result<Box<dyn EventStream>, SourceError>;
}

/// An open, ordered sequence of change events.
#[async_trait]
pub trait EventStream: Send {
    /// Wait for the next event.
    ///
    /// `Ok(None)` means the stream has ended and will never yield again.
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>, SourceError>;
}
