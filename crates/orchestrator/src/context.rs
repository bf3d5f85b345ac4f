//! Handler payload assembly, shared by the dispatcher, the retry
//! coordinator and the recovery scanner.

use adweave_core::error::AdweaveResult;
use adweave_core::stage::Stage;
use adweave_core::types::{Job, JobVariant, StageCallPayload};
use adweave_store::EntityStore;
use std::sync::Arc;
use tracing::warn;

/// Assemble the payload for invoking `stage`.
///
/// Returns `Ok(None)` when a required secondary context (overlay, copy
/// text + proposal) cannot be resolved; the caller skips the invocation and
/// leaves entity state untouched — failure marking belongs to the handler.
pub async fn build_payload(
    store: &Arc<dyn EntityStore>,
    stage: Stage,
    job: &Job,
    variant: Option<&JobVariant>,
) -> AdweaveResult<Option<StageCallPayload>> {
    let mut payload = StageCallPayload::new(job.id, job.tenant_id.clone());
    payload.job_variants_id = variant.map(|v| v.id);

    if stage.needs_overlay_context() {
        let variant = match variant {
            Some(v) => v,
            None => {
                warn!(stage = %stage, job_id = %job.id, "Overlay context requires a variant");
                return Ok(None);
            }
        };
        match store.resolve_overlay(variant.id).await? {
            Some(overlay) => payload.overlay_id = Some(overlay.overlay_id),
            None => {
                warn!(
                    stage = %stage,
                    job_id = %job.id,
                    variant_id = %variant.id,
                    "Could not resolve overlay context, skipping invocation"
                );
                metrics::counter!("dispatch.skipped_unresolved").increment(1);
                return Ok(None);
            }
        }
    }

    if stage.needs_text_and_proposal() {
        match store.resolve_copy(job.id, variant.map(|v| v.id)).await? {
            Some(copy) => {
                payload.text = Some(copy.text);
                payload.proposal_id = Some(copy.proposal_id);
                payload.x_align = copy.x_align;
                payload.y_align = copy.y_align;
            }
            None => {
                warn!(
                    stage = %stage,
                    job_id = %job.id,
                    "Could not resolve copy text and proposal, skipping invocation"
                );
                metrics::counter!("dispatch.skipped_unresolved").increment(1);
                return Ok(None);
            }
        }
    }

    Ok(Some(payload))
}
