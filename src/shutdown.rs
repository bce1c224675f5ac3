//! Coordinated shutdown.
//!
//! One [`Shutdown`] handle is shared by the whole service: the reconcile
//! loop and queue workers watch its cancellation token, and submission
//! and staging tasks register with its tracker so a stopping service can
//! wait for in-flight work before exiting. Jobs still non-terminal after
//! the drain window are picked up by the next startup reconcile.

use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen for SIGTERM and SIGINT; the first one received cancels the
    /// token.
    pub fn install_signal_handler(&self) {
        let token = self.token.clone();
        tokio::spawn(async move {
            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
            let mut sigint =
                signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    tracing::info!("received SIGINT, initiating graceful shutdown");
                }
            }
            token.cancel();
        });
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Tracker for tasks that should be drained before the process exits.
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Begin shutdown without a signal (tests, embedding services).
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes when shutdown has been requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Wait up to `timeout` for tracked tasks to finish. Returns whether
    /// everything drained in time; stragglers keep running detached and
    /// their jobs are reconciled on the next start.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();
        tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok()
    }
}
