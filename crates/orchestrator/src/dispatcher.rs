//! Event-driven stage dispatch.
//!
//! Given a just-committed `(step, status)` the dispatcher determines and
//! invokes the single next stage handler, or no-ops. Correctness under
//! concurrent dispatch relies on an optimistic re-read of entity state
//! immediately before invocation (best effort, not a lock) and on every
//! orchestrator write being a single conditional update.

use crate::context::build_payload;
use crate::invoker::StageInvoker;
use adweave_core::error::AdweaveResult;
use adweave_core::stage::{next_contract, Stage, StageContract};
use adweave_core::types::{EntityStatus, JobChange, StageCallPayload, VariantChange};
use adweave_store::EntityStore;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct StageDispatcher {
    store: Arc<dyn EntityStore>,
    invoker: Arc<dyn StageInvoker>,
}

impl StageDispatcher {
    pub fn new(store: Arc<dyn EntityStore>, invoker: Arc<dyn StageInvoker>) -> Self {
        Self { store, invoker }
    }

    /// Handle a variant-channel notification.
    pub async fn handle_variant_change(&self, change: &VariantChange) -> AdweaveResult<()> {
        let step = match change.current_step {
            Some(step) => step,
            None => return Ok(()),
        };
        let contract = match next_contract(step, change.status) {
            Some(contract) => contract,
            None => {
                debug!(
                    variant_id = %change.job_variants_id,
                    step = %step,
                    status = %change.status,
                    "No registered next stage"
                );
                return Ok(());
            }
        };

        if contract.job_level {
            return self.converge_job(change, step, contract).await;
        }

        // Optimistic guard: abort when a racing dispatch already advanced
        // the variant past the state this notification claims.
        let variant = match self.store.get_variant(change.job_variants_id).await? {
            Some(v) => v,
            None => return Ok(()),
        };
        if variant.current_step != Some(step) || variant.status != change.status {
            debug!(
                variant_id = %variant.id,
                claimed_step = %step,
                actual_step = ?variant.current_step,
                "Variant state drifted since notification, skipping dispatch"
            );
            metrics::counter!("dispatch.skipped_stale").increment(1);
            return Ok(());
        }

        let job = match self.store.get_job(change.job_id).await? {
            Some(job) => job,
            None => {
                warn!(job_id = %change.job_id, "Variant references missing job");
                return Ok(());
            }
        };

        if let Some(payload) = build_payload(&self.store, contract.next, &job, Some(&variant)).await?
        {
            self.invoke(&contract, &payload).await;
        }
        Ok(())
    }

    /// Handle a job-channel notification (or a synthesized one after a
    /// convergence flip).
    pub async fn handle_job_change(&self, change: &JobChange) -> AdweaveResult<()> {
        let step = match change.current_step {
            Some(step) => step,
            None => return Ok(()),
        };
        let contract = match next_contract(step, change.status) {
            Some(contract) => contract,
            None => return Ok(()),
        };

        if !contract.job_level {
            // Variants drive their own advancement through variant-level
            // stages; the stuck-variant check repairs the stragglers.
            debug!(job_id = %change.job_id, step = %step, "Next stage is variant-level, no job dispatch");
            return Ok(());
        }

        let job = match self.store.get_job(change.job_id).await? {
            Some(job) => job,
            None => return Ok(()),
        };
        if job.current_step != Some(step) || job.status != change.status {
            debug!(
                job_id = %job.id,
                claimed_step = %step,
                actual_step = ?job.current_step,
                "Job state drifted since notification, skipping dispatch"
            );
            metrics::counter!("dispatch.skipped_stale").increment(1);
            return Ok(());
        }

        if let Some(payload) = build_payload(&self.store, contract.next, &job, None).await? {
            self.invoke(&contract, &payload).await;
        }
        Ok(())
    }

    /// A variant reached the step feeding a job-level stage: flip the job
    /// to `(step, done)` once every sibling has converged, then re-enter
    /// job dispatch for the flipped state.
    async fn converge_job(
        &self,
        change: &VariantChange,
        step: Stage,
        contract: StageContract,
    ) -> AdweaveResult<()> {
        let variants = self.store.variants_of(change.job_id).await?;
        let converged = !variants.is_empty()
            && variants
                .iter()
                .all(|v| v.current_step == Some(step) && v.status == EntityStatus::Done);
        if !converged {
            debug!(
                job_id = %change.job_id,
                step = %step,
                total = variants.len(),
                done = variants
                    .iter()
                    .filter(|v| v.current_step == Some(step) && v.status == EntityStatus::Done)
                    .count(),
                "Variants not yet converged for job-level stage"
            );
            return Ok(());
        }

        let job = match self.store.get_job(change.job_id).await? {
            Some(job) => job,
            None => return Ok(()),
        };

        if job.current_step != Some(step) {
            debug!(job_id = %job.id, step = %step, actual = ?job.current_step, "Job not at convergence step");
            return Ok(());
        }

        if job.status == EntityStatus::Done {
            // Already flipped (by a sibling dispatch or the sweep); invoke
            // the job-level handler directly.
            if let Some(payload) = build_payload(&self.store, contract.next, &job, None).await? {
                self.invoke(&contract, &payload).await;
            }
            return Ok(());
        }

        let flipped = self
            .store
            .update_job_if(job.id, Some(step), job.status, EntityStatus::Done, false)
            .await?;
        if !flipped {
            metrics::counter!("dispatch.skipped_stale").increment(1);
            return Ok(());
        }

        info!(job_id = %job.id, step = %step, "All variants converged, job flipped to done");
        let synthesized = JobChange {
            job_id: job.id,
            current_step: Some(step),
            status: EntityStatus::Done,
            tenant_id: job.tenant_id.clone(),
            updated_at: Utc::now(),
        };
        self.handle_job_change(&synthesized).await
    }

    /// Fire the handler call; outcomes are logged and counted, never
    /// propagated. Handler-side failures are the retry coordinator's
    /// concern, transport failures the recovery scanner's.
    async fn invoke(&self, contract: &StageContract, payload: &StageCallPayload) {
        match self.invoker.invoke(contract.handler_subject, payload).await {
            Ok(()) => {
                info!(
                    stage = %contract.next,
                    job_id = %payload.job_id,
                    variant_id = ?payload.job_variants_id,
                    "Stage handler invoked"
                );
                metrics::counter!("dispatch.invoked").increment(1);
            }
            Err(e) => {
                warn!(
                    stage = %contract.next,
                    job_id = %payload.job_id,
                    error = %e,
                    "Stage handler invocation failed, state left untouched"
                );
                metrics::counter!("dispatch.failed").increment(1);
            }
        }
    }
}
