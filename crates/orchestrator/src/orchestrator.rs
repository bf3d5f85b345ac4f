//! Orchestrator lifecycle: an explicit owner object with `start()` and
//! `stop()`, no ambient global state.

use crate::dispatcher::StageDispatcher;
use crate::invoker::StageInvoker;
use crate::listener::ChangeListener;
use crate::recovery::RecoveryScanner;
use crate::retry::RetryCoordinator;
use adweave_core::config::OrchestratorConfig;
use adweave_store::{ChangeFeed, EntityStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Owns the listener and the periodic recovery sweeper.
pub struct Orchestrator {
    shutdown_tx: watch::Sender<bool>,
    listener_handle: JoinHandle<()>,
    sweeper_handle: JoinHandle<()>,
    grace: Duration,
}

impl Orchestrator {
    /// Wire the components and spawn the background tasks.
    pub fn start(
        store: Arc<dyn EntityStore>,
        feed: Box<dyn ChangeFeed>,
        invoker: Arc<dyn StageInvoker>,
        config: &OrchestratorConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let grace = Duration::from_secs(config.shutdown_grace_secs);

        let dispatcher = Arc::new(StageDispatcher::new(store.clone(), invoker.clone()));
        let retry = Arc::new(RetryCoordinator::new(store.clone(), invoker.clone()));
        let recovery = Arc::new(RecoveryScanner::new(
            store,
            invoker,
            dispatcher.clone(),
            config,
        ));

        let listener = ChangeListener::new(
            feed,
            dispatcher,
            retry,
            recovery.clone(),
            shutdown_rx.clone(),
            grace,
        );
        let listener_handle = tokio::spawn(listener.run());

        let sweep_interval = Duration::from_secs(config.sweep_interval_secs);
        let sweeper_handle = tokio::spawn(recovery.run_sweeper(sweep_interval, shutdown_rx));

        info!(
            sweep_interval_secs = config.sweep_interval_secs,
            shutdown_grace_secs = config.shutdown_grace_secs,
            "Orchestrator started"
        );

        Self {
            shutdown_tx,
            listener_handle,
            sweeper_handle,
            grace,
        }
    }

    /// Graceful shutdown: signal the background tasks, await them up to
    /// the grace period plus a small margin, then abort what remains.
    pub async fn stop(self) {
        info!("Orchestrator stopping");
        let _ = self.shutdown_tx.send(true);

        // The listener drains in-flight work within `grace` itself; allow
        // it that long plus a margin before aborting outright.
        let deadline = self.grace + Duration::from_secs(5);
        for (name, mut handle) in [
            ("listener", self.listener_handle),
            ("sweeper", self.sweeper_handle),
        ] {
            match tokio::time::timeout(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(task = name, error = %e, "Background task panicked"),
                Err(_) => {
                    warn!(task = name, "Background task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
        info!("Orchestrator stopped");
    }
}
