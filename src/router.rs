//! Partition router - maps business keys onto worker lanes.
//!
//! The [`Router`] is a pure function of the business key and the configured
//! worker count: `worker = hash(key) mod N`. Because the mapping never
//! changes for a fixed `N`, every event for a given key lands on the same
//! worker, and that worker processes them in arrival order.
//!
//! # Architecture
//!
//! ```text
//! ChangeEvent { payload.playerID = 42 }
//!     │
//!     ▼
//! ┌─────────────────────────────────────┐
//! │            ROUTER                   │
//! │                                     │
//! │  1. Extract key: payload["playerID"]│
//! │  2. SipHash-1-3("42") mod N         │
//! │  3. → worker 3                      │
//! └─────────────────────────────────────┘
//! ```
//!
//! The hash is SipHash-1-3 with a fixed key over the key's canonical text,
//! so the mapping is identical across processes, hosts and restarts.

use crate::event::{BusinessKey, ChangeEvent};
use siphasher::sip::SipHasher13;
use std::hash::Hasher;
use thiserror::Error;
use tracing::debug;

/// Fixed SipHash key. Changing it reshuffles every key onto a different lane.
const ROUTING_SEED: [u8; 16] = *b"tributary-lanes!";

/// Errors that can occur during routing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// The key field is absent from the payload
    #[error("business key field '{field}' missing from payload at {position}")]
    MissingKey { field: String, position: String },

    /// The key field holds something that cannot identify a partition
    #[error("business key field '{field}' is not an integer or non-empty string at {position}")]
    UnusableKey { field: String, position: String },
}

/// Deterministic key → worker router.
#[derive(Debug, Clone)]
pub struct Router {
    workers: usize,
    key_field: String,
    hasher: SipHasher13,
}

impl Router {
    /// Create a router over `workers` lanes reading keys from `key_field`.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is zero; configuration validation rejects that
    /// before a router is ever built.
    pub fn new(workers: usize, key_field: impl Into<String>) -> Self {
        assert!(workers > 0, "router needs at least one worker");
        Self {
            workers,
            key_field: key_field.into(),
            hasher: SipHasher13::new_with_key(&ROUTING_SEED),
        }
    }

    /// Number of lanes this router distributes over.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Payload field holding the business key.
    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    /// Map a key to its worker index.
    pub fn route(&self, key: &BusinessKey) -> usize {
        let mut state = self.hasher;
        state.write(key.canonical().as_bytes());
        (state.finish() % self.workers as u64) as usize
    }

    /// Extract the key from `event` and route it.
    pub fn route_event(&self, event: &ChangeEvent) -> Result<(BusinessKey, usize), RoutingError> {
        let key = match event.field(&self.key_field) {
            None => {
                return Err(RoutingError::MissingKey {
                    field: self.key_field.clone(),
                    position: event.commit_position.clone(),
                })
            }
            Some(value) => BusinessKey::from_value(value).ok_or_else(|| {
                RoutingError::UnusableKey {
                    field: self.key_field.clone(),
                    position: event.commit_position.clone(),
                }
            })?,
        };

        let worker = self.route(&key);
        debug!(
            key = %key,
            worker = worker,
            position = %event.commit_position,
            "Routed event"
        );
        Ok((key, worker))
    }
}
