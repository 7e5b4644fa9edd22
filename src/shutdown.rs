//! Graceful shutdown coordination for Tributary.
//!
//! This module provides a [`ShutdownSignal`] that coordinates graceful shutdown
//! between the binary's signal handler and the stream supervisor.
//!
//! The signal is level-triggered: once triggered it stays triggered, and a
//! task that subscribes afterwards still sees it.
//!
//! # Example
//!
//! ```rust,ignore
//! use tributary::shutdown::ShutdownSignal;
//!
//! #[tokio::main]
//! async fn main() {
//!     let shutdown = ShutdownSignal::new();
//!
//!     // Translate SIGINT / SIGTERM into the signal
//!     let listener = shutdown.clone();
//!     tokio::spawn(async move { listener.wait().await });
//!
//!     loop {
//!         tokio::select! {
//!             _ = shutdown.cancelled() => break,
//!             // ... read the next event
//!         }
//!     }
//! }
//! ```

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// A signal for coordinating graceful shutdown across components.
///
/// Every clone shares the same state; triggering any clone triggers all.
/// How long lanes get to drain is the supervisor's concern, not the signal's.
#[derive(Clone)]
pub struct ShutdownSignal {
    /// Watch sender for shutdown state
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Wait for SIGINT or SIGTERM (or a programmatic trigger), then trigger.
    pub async fn wait(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.cancelled() => return,
        }

        self.sender.send_replace(true);
    }

    /// Subscribe to shutdown state changes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }

    /// Check if shutdown has been triggered.
    pub fn is_shutdown(&self) -> bool {
        *self.sender.borrow()
    }

    /// Trigger shutdown manually (for testing or programmatic shutdown).
    pub fn trigger(&self) {
        if !self.sender.send_replace(true) {
            info!("Shutdown triggered programmatically");
        }
    }

    /// Resolve once shutdown has been triggered.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        if receiver.wait_for(|triggered| *triggered).await.is_err() {
            // The sender lives as long as any clone of self, so this cannot happen
            warn!("Shutdown channel closed unexpectedly");
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_signal_creation() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutdown());
        assert!(!*signal.subscribe().borrow());
    }

    #[tokio::test]
    async fn test_manual_trigger() {
        let signal = ShutdownSignal::new();

        let trigger_signal = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger_signal.trigger();
        });

        let result = tokio::time::timeout(Duration::from_millis(500), signal.cancelled()).await;
        assert!(result.is_ok());
        assert!(signal.is_shutdown());
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_signal() {
        let signal = ShutdownSignal::new();
        signal.trigger();

        // Subscribing after the fact still resolves immediately
        let late = signal.clone();
        let result = tokio::time::timeout(Duration::from_millis(50), late.cancelled()).await;
        assert!(result.is_ok());
        assert!(*late.subscribe().borrow());
    }

    #[tokio::test]
    async fn test_wait_returns_on_programmatic_trigger() {
        let signal = ShutdownSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        signal.trigger();
        let joined = tokio::time::timeout(Duration::from_millis(500), handle).await;
        assert!(joined.is_ok());
    }
}
