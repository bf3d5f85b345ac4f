//! DashMap-backed store for tests and local development.
//!
//! Doubles as a change feed: the `commit_*` helpers simulate external stage
//! handlers committing state, publishing the resulting change events on a
//! broadcast channel. Orchestrator-internal conditional updates do not
//! publish; the dispatcher re-enters itself explicitly after its own flips.

use crate::{ChangeFeed, EntityStore};
use adweave_core::error::AdweaveResult;
use adweave_core::stage::Stage;
use adweave_core::types::{
    ChangeEvent, CopyContext, EntityStatus, Job, JobChange, JobVariant, OverlayContext,
    VariantChange,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

/// Generated copy stored per job, before proposal resolution.
#[derive(Debug, Clone)]
pub struct CopyRecord {
    pub text: String,
    pub x_align: Option<String>,
    pub y_align: Option<String>,
}

/// In-memory entity store with broadcast change publication.
pub struct MemoryStore {
    jobs: DashMap<Uuid, Job>,
    variants: DashMap<Uuid, JobVariant>,
    /// asset id → winning placement proposal id.
    proposal_by_asset: DashMap<Uuid, Uuid>,
    /// proposal id → rendered overlay id.
    overlay_by_proposal: DashMap<Uuid, Uuid>,
    copy_by_job: DashMap<Uuid, CopyRecord>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            jobs: DashMap::new(),
            variants: DashMap::new(),
            proposal_by_asset: DashMap::new(),
            overlay_by_proposal: DashMap::new(),
            copy_by_job: DashMap::new(),
            changes,
        }
    }

    /// Subscribe to change events committed through this store.
    pub fn feed(&self) -> MemoryFeed {
        MemoryFeed {
            rx: self.changes.subscribe(),
        }
    }

    pub fn insert_job(&self, job: Job) {
        self.jobs.insert(job.id, job);
    }

    pub fn insert_variant(&self, variant: JobVariant) {
        self.variants.insert(variant.id, variant);
    }

    pub fn link_proposal(&self, asset_id: Uuid, proposal_id: Uuid) {
        self.proposal_by_asset.insert(asset_id, proposal_id);
    }

    pub fn link_overlay(&self, proposal_id: Uuid, overlay_id: Uuid) {
        self.overlay_by_proposal.insert(proposal_id, overlay_id);
    }

    pub fn set_copy(&self, job_id: Uuid, record: CopyRecord) {
        self.copy_by_job.insert(job_id, record);
    }

    /// Commit a job's `(current_step, status)` as an external handler
    /// would, publishing the change event.
    pub fn commit_job_state(&self, id: Uuid, step: Option<Stage>, status: EntityStatus) {
        let change = {
            let mut entry = match self.jobs.get_mut(&id) {
                Some(entry) => entry,
                None => return,
            };
            entry.current_step = step;
            entry.status = status;
            entry.updated_at = Utc::now();
            JobChange {
                job_id: entry.id,
                current_step: entry.current_step,
                status: entry.status,
                tenant_id: entry.tenant_id.clone(),
                updated_at: entry.updated_at,
            }
        };
        let _ = self.changes.send(ChangeEvent::Job(change));
    }

    /// Variant counterpart of [`MemoryStore::commit_job_state`].
    pub fn commit_variant_state(&self, id: Uuid, step: Option<Stage>, status: EntityStatus) {
        let change = {
            let mut entry = match self.variants.get_mut(&id) {
                Some(entry) => entry,
                None => return,
            };
            entry.current_step = step;
            entry.status = status;
            entry.updated_at = Utc::now();
            let tenant_id = self
                .jobs
                .get(&entry.job_id)
                .map(|j| j.tenant_id.clone())
                .unwrap_or_default();
            VariantChange {
                job_variants_id: entry.id,
                job_id: entry.job_id,
                img_asset_id: entry.img_asset_id,
                current_step: entry.current_step,
                status: entry.status,
                tenant_id,
                updated_at: entry.updated_at,
            }
        };
        let _ = self.changes.send(ChangeEvent::Variant(change));
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn get_job(&self, id: Uuid) -> AdweaveResult<Option<Job>> {
        Ok(self.jobs.get(&id).map(|j| j.clone()))
    }

    async fn get_variant(&self, id: Uuid) -> AdweaveResult<Option<JobVariant>> {
        Ok(self.variants.get(&id).map(|v| v.clone()))
    }

    async fn variants_of(&self, job_id: Uuid) -> AdweaveResult<Vec<JobVariant>> {
        let mut variants: Vec<JobVariant> = self
            .variants
            .iter()
            .filter(|v| v.job_id == job_id)
            .map(|v| v.clone())
            .collect();
        variants.sort_by_key(|v| v.creation_order);
        Ok(variants)
    }

    async fn update_job_if(
        &self,
        id: Uuid,
        expect_step: Option<Stage>,
        expect_status: EntityStatus,
        new_status: EntityStatus,
        bump_retry: bool,
    ) -> AdweaveResult<bool> {
        let mut entry = match self.jobs.get_mut(&id) {
            Some(entry) => entry,
            None => return Ok(false),
        };
        if entry.current_step != expect_step || entry.status != expect_status {
            return Ok(false);
        }
        entry.status = new_status;
        if bump_retry {
            entry.retry_count += 1;
        }
        entry.updated_at = Utc::now();
        Ok(true)
    }

    async fn update_variant_if(
        &self,
        id: Uuid,
        expect_step: Option<Stage>,
        expect_status: EntityStatus,
        new_status: EntityStatus,
        bump_retry: bool,
    ) -> AdweaveResult<bool> {
        let mut entry = match self.variants.get_mut(&id) {
            Some(entry) => entry,
            None => return Ok(false),
        };
        if entry.current_step != expect_step || entry.status != expect_status {
            return Ok(false);
        }
        entry.status = new_status;
        if bump_retry {
            entry.retry_count += 1;
        }
        entry.updated_at = Utc::now();
        Ok(true)
    }

    async fn bump_variant_retry(&self, id: Uuid) -> AdweaveResult<()> {
        if let Some(mut entry) = self.variants.get_mut(&id) {
            entry.retry_count += 1;
            entry.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn running_jobs(&self) -> AdweaveResult<Vec<Job>> {
        Ok(self
            .jobs
            .iter()
            .filter(|j| j.status == EntityStatus::Running)
            .map(|j| j.clone())
            .collect())
    }

    async fn resolve_overlay(&self, variant_id: Uuid) -> AdweaveResult<Option<OverlayContext>> {
        let asset_id = match self.variants.get(&variant_id).and_then(|v| v.img_asset_id) {
            Some(id) => id,
            None => return Ok(None),
        };
        let proposal_id = match self.proposal_by_asset.get(&asset_id) {
            Some(id) => *id,
            None => return Ok(None),
        };
        Ok(self
            .overlay_by_proposal
            .get(&proposal_id)
            .map(|overlay_id| OverlayContext {
                overlay_id: *overlay_id,
            }))
    }

    async fn resolve_copy(
        &self,
        job_id: Uuid,
        variant_id: Option<Uuid>,
    ) -> AdweaveResult<Option<CopyContext>> {
        let record = match self.copy_by_job.get(&job_id) {
            Some(record) => record.clone(),
            None => return Ok(None),
        };
        let proposal_id = match variant_id {
            Some(vid) => {
                let asset_id = self.variants.get(&vid).and_then(|v| v.img_asset_id);
                match asset_id.and_then(|aid| self.proposal_by_asset.get(&aid).map(|p| *p)) {
                    Some(id) => id,
                    None => return Ok(None),
                }
            }
            None => return Ok(None),
        };
        Ok(Some(CopyContext {
            text: record.text,
            proposal_id,
            x_align: record.x_align,
            y_align: record.y_align,
        }))
    }
}

/// Change feed over the in-memory broadcast channel.
pub struct MemoryFeed {
    rx: broadcast::Receiver<ChangeEvent>,
}

#[async_trait]
impl ChangeFeed for MemoryFeed {
    async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "change feed lagged, notifications dropped");
                    metrics::counter!("feed.lagged").increment(missed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(status: EntityStatus, step: Option<Stage>) -> Job {
        Job {
            id: Uuid::new_v4(),
            tenant_id: "tenant-1".into(),
            status,
            current_step: step,
            retry_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn variant(job_id: Uuid, order: u32) -> JobVariant {
        JobVariant {
            id: Uuid::new_v4(),
            job_id,
            creation_order: order,
            status: EntityStatus::Running,
            current_step: Some(Stage::ImgGen),
            retry_count: 0,
            img_asset_id: Some(Uuid::new_v4()),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_conditional_update_applies_only_on_match() {
        let store = MemoryStore::new();
        let j = job(EntityStatus::Running, Some(Stage::IouEval));
        let id = j.id;
        store.insert_job(j);

        // Wrong expected status: no-op.
        let applied = store
            .update_job_if(
                id,
                Some(Stage::IouEval),
                EntityStatus::Done,
                EntityStatus::Failed,
                false,
            )
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(
            store.get_job(id).await.unwrap().unwrap().status,
            EntityStatus::Running
        );

        // Matching expectation: applied, retry bumped.
        let applied = store
            .update_job_if(
                id,
                Some(Stage::IouEval),
                EntityStatus::Running,
                EntityStatus::Done,
                true,
            )
            .await
            .unwrap();
        assert!(applied);
        let j = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(j.status, EntityStatus::Done);
        assert_eq!(j.retry_count, 1);
        assert_eq!(j.current_step, Some(Stage::IouEval));
    }

    #[tokio::test]
    async fn test_variants_ordered_by_creation_order() {
        let store = MemoryStore::new();
        let j = job(EntityStatus::Running, Some(Stage::ImgGen));
        let job_id = j.id;
        store.insert_job(j);
        for order in [2u32, 0, 1] {
            store.insert_variant(variant(job_id, order));
        }
        let variants = store.variants_of(job_id).await.unwrap();
        let orders: Vec<u32> = variants.iter().map(|v| v.creation_order).collect();
        assert_eq!(orders, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_commit_publishes_change_event() {
        let store = MemoryStore::new();
        let mut feed = store.feed();
        let j = job(EntityStatus::Queued, None);
        let id = j.id;
        store.insert_job(j);

        store.commit_job_state(id, Some(Stage::ImgGen), EntityStatus::Done);

        match feed.recv().await {
            Some(ChangeEvent::Job(change)) => {
                assert_eq!(change.job_id, id);
                assert_eq!(change.current_step, Some(Stage::ImgGen));
                assert_eq!(change.status, EntityStatus::Done);
            }
            other => panic!("expected job change, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_overlay_and_copy_join_chains() {
        let store = MemoryStore::new();
        let j = job(EntityStatus::Running, Some(Stage::Planner));
        let job_id = j.id;
        store.insert_job(j);
        let v = variant(job_id, 0);
        let variant_id = v.id;
        let asset_id = v.img_asset_id.unwrap();
        store.insert_variant(v);

        // Incomplete chain resolves to None.
        assert!(store.resolve_overlay(variant_id).await.unwrap().is_none());
        assert!(store
            .resolve_copy(job_id, Some(variant_id))
            .await
            .unwrap()
            .is_none());

        let proposal_id = Uuid::new_v4();
        let overlay_id = Uuid::new_v4();
        store.link_proposal(asset_id, proposal_id);
        store.link_overlay(proposal_id, overlay_id);
        store.set_copy(
            job_id,
            CopyRecord {
                text: "신제품 출시".into(),
                x_align: Some("center".into()),
                y_align: Some("top".into()),
            },
        );

        let overlay = store.resolve_overlay(variant_id).await.unwrap().unwrap();
        assert_eq!(overlay.overlay_id, overlay_id);

        let copy = store
            .resolve_copy(job_id, Some(variant_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(copy.proposal_id, proposal_id);
        assert_eq!(copy.text, "신제품 출시");
        assert_eq!(copy.x_align.as_deref(), Some("center"));
    }
}
