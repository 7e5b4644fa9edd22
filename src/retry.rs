//! Bounded retry with a failure classifier.
//!
//! A [`RetryPolicy`] runs one unit of work until it succeeds, the classifier
//! says the failure is not worth retrying, or the attempt budget runs out:
//!
//! ```text
//! attempt 1 ──Err(transient)──> sleep(delay_for(1)) ──> attempt 2 ──> ...
//!           ──Err(validation)─> RetryError::Rejected   (no retry)
//!           ──Err(fatal)──────> RetryError::Fatal      (no retry)
//!           ──Ok(v)───────────> Ok(v)
//! ```
//!
//! Exponential backoff doubles the base delay per failed attempt, capped at
//! 2^5 times the base and at the configured maximum.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Largest doubling exponent for exponential backoff.
const MAX_BACKOFF_EXPONENT: u32 = 5;

/// How a failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Network, timeout, write conflict: worth another attempt
    Transient,
    /// Bad input: retrying cannot help, skip it
    Validation,
    /// Anything else that will fail the same way again
    Fatal,
}

/// Why a retried operation gave up.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {source}")]
    Exhausted { attempts: u32, source: E },

    #[error("rejected: {0}")]
    Rejected(E),

    #[error("fatal: {0}")]
    Fatal(E),
}

impl<E> RetryError<E> {
    /// The last underlying error.
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { source, .. } => source,
            Self::Rejected(e) | Self::Fatal(e) => e,
        }
    }
}

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    Exponential { max: Duration },
}

/// Attempt budget plus delay schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
    backoff: Backoff,
}

impl RetryPolicy {
    /// Fixed delay between attempts. `max_attempts` counts the first try.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            backoff: Backoff::Fixed,
        }
    }

    /// Doubling delay between attempts, never above `max`.
    pub fn exponential(max_attempts: u32, delay: Duration, max: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            backoff: Backoff::Exponential { max },
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Delay after the `failed`-th failed attempt (1-based).
    pub fn delay_for(&self, failed: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential { max } => {
                let exponent = failed.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
                self.delay.saturating_mul(1 << exponent).min(max)
            }
        }
    }

    /// Run `op` until it succeeds or `classify` stops it.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut, C>(&self, classify: C, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> FailureClass,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            match classify(&err) {
                FailureClass::Validation => return Err(RetryError::Rejected(err)),
                FailureClass::Fatal => return Err(RetryError::Fatal(err)),
                FailureClass::Transient if attempt >= self.max_attempts => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        source: err,
                    });
                }
                FailureClass::Transient => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt = attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(1))
    }
}
