//! Bounded re-execution of a failed stage, at job granularity.

use crate::context::build_payload;
use crate::invoker::StageInvoker;
use adweave_core::error::AdweaveResult;
use adweave_core::stage::{Stage, MAX_RETRY};
use adweave_core::types::{EntityStatus, JobChange, JobVariant};
use adweave_store::EntityStore;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct RetryCoordinator {
    store: Arc<dyn EntityStore>,
    invoker: Arc<dyn StageInvoker>,
}

impl RetryCoordinator {
    pub fn new(store: Arc<dyn EntityStore>, invoker: Arc<dyn StageInvoker>) -> Self {
        Self { store, invoker }
    }

    /// Called when a job is observed in `failed` status. Retries the failed
    /// step when the retry budget allows and every variant has failed at
    /// exactly that step; otherwise the job stays failed for manual
    /// intervention.
    pub async fn maybe_retry(&self, change: &JobChange) -> AdweaveResult<()> {
        let step = match change.current_step {
            Some(step) => step,
            None => return Ok(()),
        };

        let job = match self.store.get_job(change.job_id).await? {
            Some(job) => job,
            None => return Ok(()),
        };
        if job.current_step != Some(step) || job.status != EntityStatus::Failed {
            debug!(job_id = %job.id, "Job no longer failed at notified step, skipping retry");
            return Ok(());
        }

        if job.retry_count >= MAX_RETRY {
            error!(
                job_id = %job.id,
                step = %step,
                retry_count = job.retry_count,
                "Retry budget exhausted, job permanently failed"
            );
            metrics::counter!("retry.exhausted").increment(1);
            return Ok(());
        }

        let variants = self.store.variants_of(job.id).await?;
        if !self.retry_preconditions_met(step, &variants) {
            return Ok(());
        }

        // Flip the job back to running at the same step, bumping its retry
        // counter in the same conditional write.
        let flipped = self
            .store
            .update_job_if(
                job.id,
                Some(step),
                EntityStatus::Failed,
                EntityStatus::Running,
                true,
            )
            .await?;
        if !flipped {
            debug!(job_id = %job.id, "Lost retry race, job state moved on");
            return Ok(());
        }

        info!(
            job_id = %job.id,
            step = %step,
            attempt = job.retry_count + 1,
            max = MAX_RETRY,
            "Retrying failed stage"
        );
        metrics::counter!("retry.attempted").increment(1);

        if step.is_job_level() {
            if let Some(payload) = build_payload(&self.store, step, &job, None).await? {
                if let Err(e) = self.invoker.invoke(step.handler_subject(), &payload).await {
                    warn!(job_id = %job.id, step = %step, error = %e, "Retry invocation failed");
                }
            }
        } else {
            for variant in variants
                .iter()
                .filter(|v| v.status == EntityStatus::Failed && v.current_step == Some(step))
            {
                self.store.bump_variant_retry(variant.id).await?;
                if let Some(payload) = build_payload(&self.store, step, &job, Some(variant)).await?
                {
                    if let Err(e) = self.invoker.invoke(step.handler_subject(), &payload).await {
                        warn!(
                            job_id = %job.id,
                            variant_id = %variant.id,
                            step = %step,
                            error = %e,
                            "Retry invocation failed"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Variant-level steps retry only once every variant has failed at
    /// exactly this step, with no variant still running or queued. For
    /// job-level steps the variants never execute the step themselves;
    /// they must only be settled (none running or queued).
    fn retry_preconditions_met(&self, step: Stage, variants: &[JobVariant]) -> bool {
        let unsettled = variants
            .iter()
            .any(|v| matches!(v.status, EntityStatus::Running | EntityStatus::Queued));
        if unsettled {
            debug!(step = %step, "Variants still in flight, not retrying");
            return false;
        }
        if step.is_job_level() {
            return true;
        }
        let all_failed_here = !variants.is_empty()
            && variants
                .iter()
                .all(|v| v.status == EntityStatus::Failed && v.current_step == Some(step));
        if !all_failed_here {
            debug!(step = %step, "Not all variants failed at this step, not retrying");
        }
        all_failed_here
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::RecordingInvoker;
    use adweave_store::MemoryStore;
    use chrono::Utc;
    use uuid::Uuid;

    struct Fixture {
        store: Arc<MemoryStore>,
        invoker: Arc<RecordingInvoker>,
        retry: RetryCoordinator,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let invoker = Arc::new(RecordingInvoker::new());
        let retry = RetryCoordinator::new(store.clone(), invoker.clone());
        Fixture {
            store,
            invoker,
            retry,
        }
    }

    fn seed_failed_job(store: &MemoryStore, step: Stage, retry_count: u32) -> adweave_core::types::Job {
        let job = adweave_core::types::Job {
            id: Uuid::new_v4(),
            tenant_id: "tenant-1".into(),
            status: EntityStatus::Failed,
            current_step: Some(step),
            retry_count,
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
    ) -> adweave_core::types::JobVariant {
        let variant = adweave_core::types::JobVariant {
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

    fn failed_change(job: &adweave_core::types::Job, step: Stage) -> JobChange {
        JobChange {
            job_id: job.id,
            current_step: Some(step),
            status: EntityStatus::Failed,
            tenant_id: job.tenant_id.clone(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_retry_flips_job_and_reinvokes_failed_variants() {
        let f = fixture();
        let job = seed_failed_job(&f.store, Stage::YoloDetect, 0);
        let v1 = seed_variant(&f.store, job.id, 0, Stage::YoloDetect, EntityStatus::Failed);
        let v2 = seed_variant(&f.store, job.id, 1, Stage::YoloDetect, EntityStatus::Failed);

        f.retry
            .maybe_retry(&failed_change(&job, Stage::YoloDetect))
            .await
            .unwrap();

        let job = f.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, EntityStatus::Running);
        assert_eq!(job.current_step, Some(Stage::YoloDetect));
        assert_eq!(job.retry_count, 1);

        assert_eq!(f.invoker.count_subject("stage.yolo_detect"), 2);
        for id in [v1.id, v2.id] {
            let v = f.store.get_variant(id).await.unwrap().unwrap();
            assert_eq!(v.retry_count, 1);
        }
    }

    #[tokio::test]
    async fn test_no_retry_while_a_variant_is_running() {
        let f = fixture();
        let job = seed_failed_job(&f.store, Stage::YoloDetect, 0);
        seed_variant(&f.store, job.id, 0, Stage::YoloDetect, EntityStatus::Failed);
        seed_variant(&f.store, job.id, 1, Stage::YoloDetect, EntityStatus::Running);

        f.retry
            .maybe_retry(&failed_change(&job, Stage::YoloDetect))
            .await
            .unwrap();

        assert_eq!(f.invoker.count(), 0);
        let job = f.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, EntityStatus::Failed);
        assert_eq!(job.retry_count, 0);
    }

    #[tokio::test]
    async fn test_no_retry_when_variants_failed_at_different_step() {
        let f = fixture();
        let job = seed_failed_job(&f.store, Stage::YoloDetect, 0);
        seed_variant(&f.store, job.id, 0, Stage::YoloDetect, EntityStatus::Failed);
        seed_variant(&f.store, job.id, 1, Stage::VlmAnalyze, EntityStatus::Failed);

        f.retry
            .maybe_retry(&failed_change(&job, Stage::YoloDetect))
            .await
            .unwrap();
        assert_eq!(f.invoker.count(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_budget_leaves_job_failed() {
        let f = fixture();
        let job = seed_failed_job(&f.store, Stage::YoloDetect, MAX_RETRY);
        seed_variant(&f.store, job.id, 0, Stage::YoloDetect, EntityStatus::Failed);

        f.retry
            .maybe_retry(&failed_change(&job, Stage::YoloDetect))
            .await
            .unwrap();

        assert_eq!(f.invoker.count(), 0);
        let job = f.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, EntityStatus::Failed);
        assert_eq!(job.retry_count, MAX_RETRY);
    }

    #[tokio::test]
    async fn test_three_cycles_then_permanent_failure() {
        let f = fixture();
        let job = seed_failed_job(&f.store, Stage::OcrEval, 0);
        let v = seed_variant(&f.store, job.id, 0, Stage::OcrEval, EntityStatus::Failed);

        for attempt in 1..=MAX_RETRY {
            f.retry
                .maybe_retry(&failed_change(&job, Stage::OcrEval))
                .await
                .unwrap();
            let j = f.store.get_job(job.id).await.unwrap().unwrap();
            assert_eq!(j.status, EntityStatus::Running);
            assert_eq!(j.retry_count, attempt);

            // Handler fails again.
            f.store
                .commit_variant_state(v.id, Some(Stage::OcrEval), EntityStatus::Failed);
            f.store
                .commit_job_state(job.id, Some(Stage::OcrEval), EntityStatus::Failed);
        }
        assert_eq!(f.invoker.count_subject("stage.ocr_eval"), MAX_RETRY as usize);

        // Fourth failure: budget exhausted, no further automatic action.
        f.retry
            .maybe_retry(&failed_change(&job, Stage::OcrEval))
            .await
            .unwrap();
        let j = f.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(j.status, EntityStatus::Failed);
        assert_eq!(j.retry_count, MAX_RETRY);
        assert_eq!(f.invoker.count_subject("stage.ocr_eval"), MAX_RETRY as usize);
    }

    #[tokio::test]
    async fn test_job_level_step_retries_with_job_payload() {
        let f = fixture();
        let job = seed_failed_job(&f.store, Stage::AdCopyGenKor, 1);
        seed_variant(&f.store, job.id, 0, Stage::IouEval, EntityStatus::Done);

        f.retry
            .maybe_retry(&failed_change(&job, Stage::AdCopyGenKor))
            .await
            .unwrap();

        let calls = f.invoker.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "stage.ad_copy_gen_kor");
        assert_eq!(calls[0].1.job_variants_id, None);
        let job = f.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, EntityStatus::Running);
        assert_eq!(job.retry_count, 2);
    }

    #[tokio::test]
    async fn test_stale_notification_is_ignored() {
        let f = fixture();
        let job = seed_failed_job(&f.store, Stage::YoloDetect, 0);
        seed_variant(&f.store, job.id, 0, Stage::YoloDetect, EntityStatus::Failed);
        let change = failed_change(&job, Stage::YoloDetect);

        // Job moved on before the retry coordinator ran.
        f.store
            .commit_job_state(job.id, Some(Stage::YoloDetect), EntityStatus::Running);

        f.retry.maybe_retry(&change).await.unwrap();
        assert_eq!(f.invoker.count(), 0);
    }
}
