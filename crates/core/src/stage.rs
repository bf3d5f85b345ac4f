//! Pipeline stage enum and the static transition registry.
//!
//! Stages form a fixed total order; an entity's `current_step` only moves
//! forward along it (the retry path re-runs a step, it never rewinds one).
//! The registry maps an observed `(stage, outcome)` to the contract for the
//! next handler invocation. A missing entry means "no automatic next stage",
//! never an error.

use crate::types::EntityStatus;
use serde::{Deserialize, Serialize};

/// Maximum number of automatic retries of a failed stage, per job.
pub const MAX_RETRY: u32 = 3;

/// One named step of the creative pipeline. Declaration order is pipeline
/// order; `Ord` and [`Stage::index`] rely on it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ImgGen,
    VlmAnalyze,
    YoloDetect,
    Planner,
    Overlay,
    VlmJudge,
    OcrEval,
    ReadabilityEval,
    IouEval,
    AdCopyGenKor,
    InstagramFeedGen,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 11] = [
        Stage::ImgGen,
        Stage::VlmAnalyze,
        Stage::YoloDetect,
        Stage::Planner,
        Stage::Overlay,
        Stage::VlmJudge,
        Stage::OcrEval,
        Stage::ReadabilityEval,
        Stage::IouEval,
        Stage::AdCopyGenKor,
        Stage::InstagramFeedGen,
    ];

    /// Zero-based position in the pipeline order.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Wire name of the stage, matching the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::ImgGen => "img_gen",
            Stage::VlmAnalyze => "vlm_analyze",
            Stage::YoloDetect => "yolo_detect",
            Stage::Planner => "planner",
            Stage::Overlay => "overlay",
            Stage::VlmJudge => "vlm_judge",
            Stage::OcrEval => "ocr_eval",
            Stage::ReadabilityEval => "readability_eval",
            Stage::IouEval => "iou_eval",
            Stage::AdCopyGenKor => "ad_copy_gen_kor",
            Stage::InstagramFeedGen => "instagram_feed_gen",
        }
    }

    /// NATS subject suffix of the stage's handler. The configured subject
    /// prefix is prepended at invocation time.
    pub fn handler_subject(self) -> &'static str {
        match self {
            Stage::ImgGen => "stage.img_gen",
            Stage::VlmAnalyze => "stage.vlm_analyze",
            Stage::YoloDetect => "stage.yolo_detect",
            Stage::Planner => "stage.planner",
            Stage::Overlay => "stage.overlay",
            Stage::VlmJudge => "stage.vlm_judge",
            Stage::OcrEval => "stage.ocr_eval",
            Stage::ReadabilityEval => "stage.readability_eval",
            Stage::IouEval => "stage.iou_eval",
            Stage::AdCopyGenKor => "stage.ad_copy_gen_kor",
            Stage::InstagramFeedGen => "stage.instagram_feed_gen",
        }
    }

    /// Stages executed once per job, only after all variants converge.
    pub fn is_job_level(self) -> bool {
        matches!(self, Stage::AdCopyGenKor | Stage::InstagramFeedGen)
    }

    /// The overlay renderer needs the generated copy text and the winning
    /// placement proposal resolved before it can be called.
    pub fn needs_text_and_proposal(self) -> bool {
        matches!(self, Stage::Overlay)
    }

    /// The judge needs the rendered overlay asset resolved before it can
    /// be called.
    pub fn needs_overlay_context(self) -> bool {
        matches!(self, Stage::VlmJudge)
    }

    /// The stage after this one in pipeline order, if any.
    pub fn successor(self) -> Option<Stage> {
        Stage::ALL.get(self.index() + 1).copied()
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage name: {s}"))
    }
}

/// Invocation contract for the next stage after an observed transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageContract {
    /// The stage whose handler is to be invoked.
    pub next: Stage,
    /// Handler subject suffix (same as `next.handler_subject()`).
    pub handler_subject: &'static str,
    /// Whether the handler runs at job granularity.
    pub job_level: bool,
    /// Whether the dispatcher must resolve the rendered overlay first.
    pub needs_overlay_context: bool,
    /// Whether the dispatcher must resolve copy text + winning proposal.
    pub needs_text_and_proposal: bool,
}

impl StageContract {
    fn for_stage(next: Stage) -> Self {
        Self {
            next,
            handler_subject: next.handler_subject(),
            job_level: next.is_job_level(),
            needs_overlay_context: next.needs_overlay_context(),
            needs_text_and_proposal: next.needs_text_and_proposal(),
        }
    }
}

/// Look up the contract for the stage following `(step, outcome)`.
///
/// Only `done` outcomes advance the pipeline; failures are handled by the
/// retry coordinator, and the final stage has no successor.
pub fn next_contract(step: Stage, outcome: EntityStatus) -> Option<StageContract> {
    if outcome != EntityStatus::Done {
        return None;
    }
    step.successor().map(StageContract::for_stage)
}
