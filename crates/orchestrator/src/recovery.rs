//! Stuck-entity detection and repair.
//!
//! Two complementary mechanisms cover notifications that were missed and
//! handlers that failed silently between commit and re-dispatch: a reactive
//! check on every job-level event, and a periodic sweep for the convergence
//! flip that should have happened reactively but didn't.

use crate::context::build_payload;
use crate::dispatcher::StageDispatcher;
use crate::invoker::StageInvoker;
use adweave_core::config::OrchestratorConfig;
use adweave_core::error::AdweaveResult;
use adweave_core::stage::{next_contract, Stage};
use adweave_core::types::{EntityStatus, Job, JobChange, JobVariant};
use adweave_store::EntityStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub struct RecoveryScanner {
    store: Arc<dyn EntityStore>,
    invoker: Arc<dyn StageInvoker>,
    dispatcher: Arc<StageDispatcher>,
    stuck_running_threshold: Duration,
}

impl RecoveryScanner {
    pub fn new(
        store: Arc<dyn EntityStore>,
        invoker: Arc<dyn StageInvoker>,
        dispatcher: Arc<StageDispatcher>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            invoker,
            dispatcher,
            stuck_running_threshold: Duration::from_secs(config.stuck_running_threshold_secs),
        }
    }

    /// Reactive check, run on every job-level event: re-invoke variants
    /// that fell strictly behind the job's step.
    pub async fn check_stuck_variants(&self, change: &JobChange) -> AdweaveResult<()> {
        let job_step = match change.current_step {
            Some(step) => step,
            None => return Ok(()),
        };
        let job = match self.store.get_job(change.job_id).await? {
            Some(job) => job,
            None => return Ok(()),
        };

        for variant in self.store.variants_of(job.id).await? {
            let variant_step = match variant.current_step {
                Some(step) if step < job_step => step,
                // At or past the job's step (or not yet started): not stuck.
                _ => continue,
            };
            match variant.status {
                EntityStatus::Done => {
                    self.reinvoke_next(&job, &variant, variant_step).await?;
                }
                EntityStatus::Failed => {
                    // Treat the failure as transient: flip to done at the
                    // same step and re-attempt forward progress.
                    let flipped = self
                        .store
                        .update_variant_if(
                            variant.id,
                            Some(variant_step),
                            EntityStatus::Failed,
                            EntityStatus::Done,
                            false,
                        )
                        .await?;
                    if flipped {
                        info!(
                            variant_id = %variant.id,
                            step = %variant_step,
                            "Stuck failed variant flipped to done for re-attempt"
                        );
                        metrics::counter!("recovery.variants_repaired").increment(1);
                        self.reinvoke_next(&job, &variant, variant_step).await?;
                    }
                }
                EntityStatus::Running => {
                    let stalled = Utc::now()
                        .signed_duration_since(variant.updated_at)
                        .to_std()
                        .map(|d| d > self.stuck_running_threshold)
                        .unwrap_or(false);
                    if stalled {
                        warn!(
                            variant_id = %variant.id,
                            step = %variant_step,
                            job_step = %job_step,
                            "Variant running behind job past threshold, not force-advancing"
                        );
                        metrics::counter!("recovery.stalled_running").increment(1);
                    }
                }
                EntityStatus::Queued => {}
            }
        }
        Ok(())
    }

    /// Re-invoke the stage after `step` for a stuck variant, bypassing the
    /// notification path. Job-level successors are left to the convergence
    /// logic.
    async fn reinvoke_next(
        &self,
        job: &Job,
        variant: &JobVariant,
        step: Stage,
    ) -> AdweaveResult<()> {
        let contract = match next_contract(step, EntityStatus::Done) {
            Some(contract) if !contract.job_level => contract,
            _ => return Ok(()),
        };
        if let Some(payload) = build_payload(&self.store, contract.next, job, Some(variant)).await?
        {
            match self.invoker.invoke(contract.handler_subject, &payload).await {
                Ok(()) => {
                    info!(
                        variant_id = %variant.id,
                        stage = %contract.next,
                        "Stuck variant re-invoked"
                    );
                    metrics::counter!("recovery.variants_repaired").increment(1);
                }
                Err(e) => {
                    warn!(
                        variant_id = %variant.id,
                        stage = %contract.next,
                        error = %e,
                        "Stuck variant re-invocation failed"
                    );
                }
            }
        }
        Ok(())
    }

    /// One pass of the periodic sweep: find running jobs whose variants
    /// have all converged at the job's step and perform the convergence
    /// flip that was missed, marking it with a retry-count bump.
    pub async fn sweep_once(&self) -> AdweaveResult<usize> {
        let mut flipped = 0usize;
        for job in self.store.running_jobs().await? {
            let step = match job.current_step {
                Some(step) => step,
                None => continue,
            };
            let variants = self.store.variants_of(job.id).await?;
            let converged = !variants.is_empty()
                && variants
                    .iter()
                    .all(|v| v.current_step == Some(step) && v.status == EntityStatus::Done);
            if !converged {
                continue;
            }

            let applied = self
                .store
                .update_job_if(
                    job.id,
                    Some(step),
                    EntityStatus::Running,
                    EntityStatus::Done,
                    true,
                )
                .await?;
            if !applied {
                continue;
            }
            flipped += 1;
            info!(
                job_id = %job.id,
                step = %step,
                "Sweep recovered missed convergence flip"
            );
            metrics::counter!("recovery.sweep_flips").increment(1);

            let synthesized = JobChange {
                job_id: job.id,
                current_step: Some(step),
                status: EntityStatus::Done,
                tenant_id: job.tenant_id.clone(),
                updated_at: Utc::now(),
            };
            if let Err(e) = self.dispatcher.handle_job_change(&synthesized).await {
                error!(job_id = %job.id, error = %e, "Dispatch after sweep flip failed");
            }
        }
        Ok(flipped)
    }

    /// Periodic sweep loop; runs until the shutdown flag flips.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so startup does not
        // race the listener's subscription.
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender means the owner is gone; stop rather
                    // than spin on the closed channel.
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Recovery sweeper shutting down");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(0) => debug!("Recovery sweep found nothing to repair"),
                        Ok(n) => info!(flipped = n, "Recovery sweep repaired jobs"),
                        Err(e) => error!(error = %e, "Recovery sweep failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::RecordingInvoker;
    use adweave_store::MemoryStore;
    use uuid::Uuid;

    struct Fixture {
        store: Arc<MemoryStore>,
        invoker: Arc<RecordingInvoker>,
        scanner: RecoveryScanner,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let invoker = Arc::new(RecordingInvoker::new());
        let dispatcher = Arc::new(StageDispatcher::new(store.clone(), invoker.clone()));
        let scanner = RecoveryScanner::new(
            store.clone(),
            invoker.clone(),
            dispatcher,
            &OrchestratorConfig::default(),
        );
        Fixture {
            store,
            invoker,
            scanner,
        }
    }

    fn seed_job(store: &MemoryStore, step: Stage, status: EntityStatus) -> Job {
        let job = Job {
            id: Uuid::new_v4(),
            tenant_id: "tenant-1".into(),
            status,
            current_step: Some(step),
            retry_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.insert_job(job.clone());
        job
    }

    fn seed_variant(
        store: &MemoryStore,
        job_id: Uuid,
        order: u32,
        step: Stage,
        status: EntityStatus,
    ) -> JobVariant {
        let variant = JobVariant {
            id: Uuid::new_v4(),
            job_id,
            creation_order: order,
            status,
            current_step: Some(step),
            retry_count: 0,
            img_asset_id: Some(Uuid::new_v4()),
            updated_at: Utc::now(),
        };
        store.insert_variant(variant.clone());
        variant
    }

    fn job_change(job: &Job) -> JobChange {
        JobChange {
            job_id: job.id,
            current_step: job.current_step,
            status: job.status,
            tenant_id: job.tenant_id.clone(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_stuck_done_variant_is_reinvoked() {
        let f = fixture();
        let job = seed_job(&f.store, Stage::Overlay, EntityStatus::Running);
        let v = seed_variant(&f.store, job.id, 0, Stage::VlmAnalyze, EntityStatus::Done);

        f.scanner.check_stuck_variants(&job_change(&job)).await.unwrap();

        let calls = f.invoker.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "stage.yolo_detect");
        assert_eq!(calls[0].1.job_variants_id, Some(v.id));
    }

    #[tokio::test]
    async fn test_stuck_failed_variant_is_flipped_and_reinvoked() {
        let f = fixture();
        let job = seed_job(&f.store, Stage::Overlay, EntityStatus::Running);
        let v = seed_variant(&f.store, job.id, 0, Stage::VlmAnalyze, EntityStatus::Failed);

        f.scanner.check_stuck_variants(&job_change(&job)).await.unwrap();

        let v = f.store.get_variant(v.id).await.unwrap().unwrap();
        assert_eq!(v.status, EntityStatus::Done);
        assert_eq!(v.current_step, Some(Stage::VlmAnalyze));
        assert_eq!(f.invoker.count_subject("stage.yolo_detect"), 1);
    }

    #[tokio::test]
    async fn test_fresh_running_variant_is_left_alone() {
        let f = fixture();
        let job = seed_job(&f.store, Stage::Overlay, EntityStatus::Running);
        seed_variant(&f.store, job.id, 0, Stage::VlmAnalyze, EntityStatus::Running);

        f.scanner.check_stuck_variants(&job_change(&job)).await.unwrap();
        assert_eq!(f.invoker.count(), 0);
    }

    #[tokio::test]
    async fn test_long_running_variant_is_only_logged() {
        let f = fixture();
        let job = seed_job(&f.store, Stage::Overlay, EntityStatus::Running);
        let mut v = seed_variant(&f.store, job.id, 0, Stage::VlmAnalyze, EntityStatus::Running);
        v.updated_at = Utc::now() - chrono::Duration::minutes(10);
        f.store.insert_variant(v.clone());

        f.scanner.check_stuck_variants(&job_change(&job)).await.unwrap();

        // Logged only, never force-advanced or re-invoked.
        assert_eq!(f.invoker.count(), 0);
        let v = f.store.get_variant(v.id).await.unwrap().unwrap();
        assert_eq!(v.status, EntityStatus::Running);
    }

    #[tokio::test]
    async fn test_variant_at_job_step_is_not_stuck() {
        let f = fixture();
        let job = seed_job(&f.store, Stage::Overlay, EntityStatus::Running);
        seed_variant(&f.store, job.id, 0, Stage::Overlay, EntityStatus::Done);

        f.scanner.check_stuck_variants(&job_change(&job)).await.unwrap();
        assert_eq!(f.invoker.count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_flips_converged_running_job() {
        let f = fixture();
        let job = seed_job(&f.store, Stage::IouEval, EntityStatus::Running);
        seed_variant(&f.store, job.id, 0, Stage::IouEval, EntityStatus::Done);
        seed_variant(&f.store, job.id, 1, Stage::IouEval, EntityStatus::Done);

        let flipped = f.scanner.sweep_once().await.unwrap();
        assert_eq!(flipped, 1);

        let job = f.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, EntityStatus::Done);
        assert_eq!(job.current_step, Some(Stage::IouEval));
        // Bumped to mark the manually-recovered transition.
        assert_eq!(job.retry_count, 1);

        // The flip recursed into job dispatch for the job-level stage.
        assert_eq!(f.invoker.count_subject("stage.ad_copy_gen_kor"), 1);
    }

    #[tokio::test]
    async fn test_sweep_skips_jobs_with_stragglers() {
        let f = fixture();
        let job = seed_job(&f.store, Stage::IouEval, EntityStatus::Running);
        seed_variant(&f.store, job.id, 0, Stage::IouEval, EntityStatus::Done);
        seed_variant(&f.store, job.id, 1, Stage::IouEval, EntityStatus::Failed);

        let flipped = f.scanner.sweep_once().await.unwrap();
        assert_eq!(flipped, 0);
        assert_eq!(f.invoker.count(), 0);
        let job = f.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, EntityStatus::Running);
    }
}
