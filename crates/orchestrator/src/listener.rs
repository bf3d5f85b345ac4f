//! Change-feed consumption with one supervised task per notification.
//!
//! Every delivered notification is dispatched as an independent unit of
//! work; one entity's failure never cancels siblings. Shutdown stops
//! accepting notifications, drains in-flight tasks up to a bounded grace
//! period, then force-cancels the remainder.

use crate::dispatcher::StageDispatcher;
use crate::recovery::RecoveryScanner;
use crate::retry::RetryCoordinator;
use adweave_core::types::{ChangeEvent, EntityStatus};
use adweave_store::ChangeFeed;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

pub struct ChangeListener {
    feed: Box<dyn ChangeFeed>,
    dispatcher: Arc<StageDispatcher>,
    retry: Arc<RetryCoordinator>,
    recovery: Arc<RecoveryScanner>,
    shutdown: watch::Receiver<bool>,
    grace: Duration,
}

impl ChangeListener {
    pub fn new(
        feed: Box<dyn ChangeFeed>,
        dispatcher: Arc<StageDispatcher>,
        retry: Arc<RetryCoordinator>,
        recovery: Arc<RecoveryScanner>,
        shutdown: watch::Receiver<bool>,
        grace: Duration,
    ) -> Self {
        Self {
            feed,
            dispatcher,
            retry,
            recovery,
            shutdown,
            grace,
        }
    }

    /// Consume the feed until shutdown or feed close, then drain.
    pub async fn run(mut self) {
        let mut tasks: JoinSet<()> = JoinSet::new();
        info!("Change listener started");

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    // A dropped sender means the owner is gone; stop rather
                    // than spin on the closed channel.
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!("Change listener stopping, no new notifications accepted");
                        break;
                    }
                }
                event = self.feed.recv() => match event {
                    Some(event) => {
                        let dispatcher = self.dispatcher.clone();
                        let retry = self.retry.clone();
                        let recovery = self.recovery.clone();
                        tasks.spawn(async move {
                            route_event(dispatcher, retry, recovery, event).await;
                        });
                        metrics::counter!("listener.notifications").increment(1);
                    }
                    None => {
                        warn!("Change feed closed, listener stopping");
                        break;
                    }
                },
                // Reap finished dispatch tasks as they complete.
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = result {
                        error!(error = %e, "Dispatch task panicked");
                        metrics::counter!("listener.task_panics").increment(1);
                    }
                }
            }
        }

        self.drain(tasks).await;
        info!("Change listener stopped");
    }

    /// Await outstanding dispatch work up to the grace period, then
    /// force-cancel whatever remains.
    async fn drain(&self, mut tasks: JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }
        info!(in_flight = tasks.len(), "Draining in-flight dispatch tasks");
        let drained = tokio::time::timeout(self.grace, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "Dispatch task panicked during drain");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                grace_secs = self.grace.as_secs(),
                "Drain grace period elapsed, force-cancelling dispatch tasks"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}

/// Route one notification. Errors are contained here: logged and counted,
/// never propagated across entity boundaries.
async fn route_event(
    dispatcher: Arc<StageDispatcher>,
    retry: Arc<RetryCoordinator>,
    recovery: Arc<RecoveryScanner>,
    event: ChangeEvent,
) {
    match event {
        ChangeEvent::Job(change) => {
            // The reactive stuck-variant check runs on every job-level
            // event, independently of normal dispatch.
            if let Err(e) = recovery.check_stuck_variants(&change).await {
                error!(job_id = %change.job_id, error = %e, "Stuck-variant check failed");
            }
            let result = if change.status == EntityStatus::Failed {
                retry.maybe_retry(&change).await
            } else {
                dispatcher.handle_job_change(&change).await
            };
            if let Err(e) = result {
                error!(job_id = %change.job_id, error = %e, "Job event dispatch failed");
                metrics::counter!("listener.dispatch_errors").increment(1);
            }
        }
        ChangeEvent::Variant(change) => {
            if let Err(e) = dispatcher.handle_variant_change(&change).await {
                error!(
                    variant_id = %change.job_variants_id,
                    error = %e,
                    "Variant event dispatch failed"
                );
                metrics::counter!("listener.dispatch_errors").increment(1);
            }
        }
    }
}
