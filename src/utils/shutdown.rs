use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use tokio::{signal, sync::broadcast, time::sleep};

/// Grace period between the shutdown broadcast and process exit, giving
/// listeners and background tasks a moment to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Coordinates shutdown across every listener and background task.
///
/// Interested tasks call [`ShutdownCoordinator::subscribe`] and select on the
/// returned receiver. The first SIGINT/SIGTERM (or manual trigger) fires the
/// broadcast exactly once; later signals are ignored.
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
    triggered: AtomicBool,
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::with_grace(SHUTDOWN_GRACE)
    }

    /// Create a coordinator with a custom grace period.
    pub fn with_grace(grace: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            triggered: AtomicBool::new(false),
            grace,
        }
    }

    /// Get a receiver for the shutdown broadcast.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Check whether shutdown has been initiated.
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Relaxed)
    }

    /// Fire the shutdown broadcast. Returns `true` for the call that actually
    /// initiated shutdown, `false` for every repeat.
    pub fn trigger(&self) -> bool {
        if self
            .triggered
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            // Send only fails when nothing subscribed, which is fine.
            let _ = self.shutdown_tx.send(());
            true
        } else {
            tracing::warn!("shutdown already initiated, ignoring repeat trigger");
            false
        }
    }

    /// Listen for OS termination signals, broadcast shutdown, wait out the
    /// grace period, then exit the process with status 0.
    ///
    /// An operator stopping the service is a normal outcome, not a failure,
    /// so supervisors must not see a non-zero status and restart-loop us.
    pub async fn run_signal_handler(&self) {
        tracing::info!("signal handler started, listening for SIGINT and SIGTERM");

        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = wait_for_sigterm() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        self.trigger();
        sleep(self.grace).await;
        std::process::exit(0);
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!("failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // Only Ctrl+C is available off Unix.
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_coordinator_starts_untriggered() {
        let shutdown = ShutdownCoordinator::new();
        assert!(!shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_trigger_reaches_subscriber() {
        let shutdown = ShutdownCoordinator::new();
        let mut receiver = shutdown.subscribe();

        assert!(shutdown.trigger());
        assert!(shutdown.is_triggered());
        receiver.try_recv().unwrap();
    }

    #[tokio::test]
    async fn test_repeat_trigger_is_ignored() {
        let shutdown = ShutdownCoordinator::new();
        let mut receiver = shutdown.subscribe();

        assert!(shutdown.trigger());
        assert!(!shutdown.trigger());
        assert!(!shutdown.trigger());

        // Exactly one broadcast went out.
        receiver.try_recv().unwrap();
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_all_subscribers_observe_shutdown() {
        let shutdown = ShutdownCoordinator::new();
        let mut receiver1 = shutdown.subscribe();
        let mut receiver2 = shutdown.subscribe();

        shutdown.trigger();

        receiver1.try_recv().unwrap();
        receiver2.try_recv().unwrap();
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_triggered_flag() {
        let shutdown = ShutdownCoordinator::new();
        shutdown.trigger();

        // The broadcast is gone, but the flag still reports state.
        assert!(shutdown.is_triggered());
        let mut late = shutdown.subscribe();
        assert!(late.try_recv().is_err());
    }
}
