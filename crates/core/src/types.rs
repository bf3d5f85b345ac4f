use crate::stage::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a job or variant at its current step.
///
/// Transitions run `queued → running → {done, failed}`; the retry
/// coordinator may flip `failed` back to `running` at the same step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl std::fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntityStatus::Queued => "queued",
            EntityStatus::Running => "running",
            EntityStatus::Done => "done",
            EntityStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One end-to-end creative-generation request for a tenant.
///
/// The orchestrator owns transition fields only; content fields (prompt,
/// generated copy, assets) live with the stage handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub tenant_id: String,
    pub status: EntityStatus,
    pub current_step: Option<Stage>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One of several parallel candidate outputs generated for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobVariant {
    pub id: Uuid,
    pub job_id: Uuid,
    pub creation_order: u32,
    pub status: EntityStatus,
    pub current_step: Option<Stage>,
    pub retry_count: u32,
    /// Working asset of this variant, owned by the image handlers.
    pub img_asset_id: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

/// Change notification published on the job channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobChange {
    pub job_id: Uuid,
    pub current_step: Option<Stage>,
    pub status: EntityStatus,
    pub tenant_id: String,
    pub updated_at: DateTime<Utc>,
}

/// Change notification published on the variant channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantChange {
    pub job_variants_id: Uuid,
    pub job_id: Uuid,
    pub img_asset_id: Option<Uuid>,
    pub current_step: Option<Stage>,
    pub status: EntityStatus,
    pub tenant_id: String,
    pub updated_at: DateTime<Utc>,
}

/// A delivered change notification from either channel.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Job(JobChange),
    Variant(VariantChange),
}

/// Payload of a stage handler invocation.
///
/// The handler performs the stage's work and commits its own entity's
/// `(current_step, status)`; the orchestrator never writes a handler's
/// target state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageCallPayload {
    pub job_id: Uuid,
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_variants_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlay_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x_align: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y_align: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposal_id: Option<Uuid>,
}

impl StageCallPayload {
    /// Minimal payload carrying only the entity identifiers.
    pub fn new(job_id: Uuid, tenant_id: impl Into<String>) -> Self {
        Self {
            job_id,
            tenant_id: tenant_id.into(),
            job_variants_id: None,
            overlay_id: None,
            text: None,
            x_align: None,
            y_align: None,
            proposal_id: None,
        }
    }
}

/// Rendered-overlay context resolved by joining variant → asset →
/// proposal → overlay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayContext {
    pub overlay_id: Uuid,
}

/// Generated copy text plus the winning placement proposal, resolved for
/// the overlay renderer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyContext {
    pub text: String,
    pub proposal_id: Uuid,
    pub x_align: Option<String>,
    pub y_align: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_change_round_trips() {
        let change = VariantChange {
            job_variants_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            img_asset_id: Some(Uuid::new_v4()),
            current_step: Some(Stage::YoloDetect),
            status: EntityStatus::Done,
            tenant_id: "tenant-1".into(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string(&change).unwrap();
        assert!(json.contains("\"yolo_detect\""));
        assert!(json.contains("\"done\""));
        let back: VariantChange = serde_json::from_str(&json).unwrap();
        assert_eq!(back.job_variants_id, change.job_variants_id);
        assert_eq!(back.current_step, Some(Stage::YoloDetect));
    }

    #[test]
    fn test_payload_omits_absent_context() {
        let payload = StageCallPayload::new(Uuid::new_v4(), "tenant-1");
        let json = serde_json::to_string(&payload).unwrap();
        assert!(!json.contains("overlay_id"));
        assert!(!json.contains("proposal_id"));
        assert!(json.contains("tenant_id"));
    }
}
