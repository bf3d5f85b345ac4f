//! Entity state access and change notification for the orchestrator.
//!
//! The orchestrator only needs two narrow contracts from persistence: read
//! and conditionally update job/variant state, and receive change
//! notifications when a stage handler commits new state. [`EntityStore`] and
//! [`ChangeFeed`] are those seams; [`MemoryStore`] backs tests and local
//! development, [`RedisStore`] + [`NatsChangeFeed`] back production.

pub mod feed;
pub mod memory;
pub mod redis_store;

use adweave_core::error::AdweaveResult;
use adweave_core::stage::Stage;
use adweave_core::types::{ChangeEvent, CopyContext, EntityStatus, Job, JobVariant, OverlayContext};
use async_trait::async_trait;
use uuid::Uuid;

pub use feed::NatsChangeFeed;
pub use memory::{MemoryFeed, MemoryStore};
pub use redis_store::RedisStore;

/// Read and conditional-write access to orchestration state.
///
/// Every write is a single conditional update scoped to one entity: the
/// update applies only when the entity is still at the expected
/// `(current_step, status)`, and reports whether it did. The orchestrator
/// never advances `current_step` itself; it only flips status at the step
/// the entity already sits at.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get_job(&self, id: Uuid) -> AdweaveResult<Option<Job>>;

    async fn get_variant(&self, id: Uuid) -> AdweaveResult<Option<JobVariant>>;

    /// All variants of a job, ordered by `creation_order`.
    async fn variants_of(&self, job_id: Uuid) -> AdweaveResult<Vec<JobVariant>>;

    /// Conditionally set the job's status (same step), optionally bumping
    /// its retry counter. Returns whether the update applied.
    async fn update_job_if(
        &self,
        id: Uuid,
        expect_step: Option<Stage>,
        expect_status: EntityStatus,
        new_status: EntityStatus,
        bump_retry: bool,
    ) -> AdweaveResult<bool>;

    /// Variant counterpart of [`EntityStore::update_job_if`].
    async fn update_variant_if(
        &self,
        id: Uuid,
        expect_step: Option<Stage>,
        expect_status: EntityStatus,
        new_status: EntityStatus,
        bump_retry: bool,
    ) -> AdweaveResult<bool>;

    /// Increment a variant's retry counter without touching its status.
    async fn bump_variant_retry(&self, id: Uuid) -> AdweaveResult<()>;

    /// Jobs currently in `running` status, for the periodic sweep.
    async fn running_jobs(&self) -> AdweaveResult<Vec<Job>>;

    /// Resolve the rendered overlay of a variant by joining variant →
    /// asset → proposal → overlay. `None` when any link is missing.
    async fn resolve_overlay(&self, variant_id: Uuid) -> AdweaveResult<Option<OverlayContext>>;

    /// Resolve generated copy text plus the winning proposal for the
    /// overlay renderer. `None` when either piece is missing.
    async fn resolve_copy(
        &self,
        job_id: Uuid,
        variant_id: Option<Uuid>,
    ) -> AdweaveResult<Option<CopyContext>>;
}

/// Source of entity-change notifications.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Next change notification; `None` when the feed has closed.
    async fn recv(&mut self) -> Option<ChangeEvent>;
}
