//! Process-wide shutdown coordination.
//!
//! A `Shutdown` carries two phases: "begin", signalled the moment a shutdown
//! request is observed (Ctrl-C or SIGTERM), and "complete", signalled once the
//! shutdown delay has elapsed or the shutdown timeout is reached. Background
//! tasks race their own work against `await_shutdown_begin()` so they can stop
//! picking up new work immediately, while `axum::serve(..).with_graceful_shutdown`
//! is driven by `await_shutdown()`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

#[derive(Clone)]
pub struct Shutdown {
    begin_tx: Arc<watch::Sender<bool>>,
    begin_rx: watch::Receiver<bool>,
    complete_tx: Arc<watch::Sender<bool>>,
    complete_rx: watch::Receiver<bool>,
    delay: Duration,
    timeout: Duration,
}

impl Shutdown {
    /// Spawns the signal-handling task and returns the handle used to query
    /// and await shutdown state.
    ///
    /// `timeout` bounds how long a delayed shutdown (see `delay`) can take
    /// before it is forced; `delay` is the grace period between the "begin"
    /// signal and the "complete" signal, giving in-flight requests a chance
    /// to finish.
    #[must_use]
    pub fn spawn(timeout: Duration, delay: Duration) -> Self {
        let (begin_tx, begin_rx) = watch::channel(false);
        let (complete_tx, complete_rx) = watch::channel(false);

        let handle = Self {
            begin_tx: Arc::new(begin_tx),
            begin_rx,
            complete_tx: Arc::new(complete_tx),
            complete_rx,
            delay,
            timeout,
        };

        tokio::spawn(Self::watch_signals(handle.clone()));

        handle
    }

    async fn watch_signals(self) {
        wait_for_signal().await;
        info!("Shutdown signal received");
        self.shutdown();
    }

    /// Triggers shutdown immediately. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.begin_tx.send(true);

        let complete_tx = self.complete_tx.clone();
        let delay = self.delay;
        let timeout = self.timeout;

        tokio::spawn(async move {
            tokio::time::sleep(delay.min(timeout)).await;
            let _ = complete_tx.send(true);
        });
    }

    /// Resolves as soon as shutdown has been requested.
    pub async fn await_shutdown_begin(&self) {
        let mut rx = self.begin_rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    /// Resolves once the shutdown grace period has elapsed. Suitable for
    /// `axum::serve(..).with_graceful_shutdown`.
    pub async fn await_shutdown(&self) {
        let mut rx = self.complete_rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.begin_rx.borrow()
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_is_observed() {
        let shutdown = Shutdown::spawn(Duration::from_secs(5), Duration::from_millis(10));
        assert!(!shutdown.is_shutting_down());

        shutdown.shutdown();

        tokio::time::timeout(Duration::from_secs(1), shutdown.await_shutdown_begin())
            .await
            .expect("begin should resolve");
        assert!(shutdown.is_shutting_down());

        tokio::time::timeout(Duration::from_secs(1), shutdown.await_shutdown())
            .await
            .expect("complete should resolve");
    }

    #[tokio::test]
    async fn clone_shares_state() {
        let shutdown = Shutdown::spawn(Duration::from_secs(5), Duration::from_millis(10));
        let other = shutdown.clone();

        shutdown.shutdown();

        tokio::time::timeout(Duration::from_secs(1), other.await_shutdown_begin())
            .await
            .expect("clone should observe begin");
    }
}
