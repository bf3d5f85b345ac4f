//! Placement planning: propose overlay regions that avoid forbidden
//! geometry, ranked and diversified across size buckets.

use crate::candidates::{grid_candidates, heuristic_candidates, RawCandidate};
use crate::geometry::{bbox_of, ForbiddenMask, Rect};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Safety margin kept between the forbidden bounding box and the strips
/// searched for the maximum free region.
const FREE_REGION_MARGIN: f32 = 0.02;

/// Two candidates of the same size bucket closer than this fraction of the
/// larger candidate's extent, on both axes, are considered duplicates.
const DEDUP_CENTER_FRACTION: f32 = 0.30;

/// Where a candidate region came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    HeuristicAnchor,
    GridSearch,
    MaxFreeRegion,
}

/// A proposed overlay region in normalized coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementCandidate {
    pub id: Uuid,
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub score: f32,
    pub source: CandidateSource,
    pub occlusion_iou: f32,
}

impl PlacementCandidate {
    pub fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.w, self.h)
    }
}

/// Horizontal dominance of the forbidden geometry within the image.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HorizontalPos {
    Left,
    Center,
    Right,
}

/// Vertical dominance of the forbidden geometry within the image.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerticalPos {
    Top,
    Middle,
    Bottom,
}

/// Summary of where the forbidden geometry sits, used downstream as copy
/// alignment hints.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ForbiddenPosition {
    pub x: HorizontalPos,
    pub y: VerticalPos,
}

/// Input of the placement planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerRequest {
    pub image_width: u32,
    pub image_height: u32,
    /// Normalized xywh boxes the overlay must avoid.
    #[serde(default)]
    pub forbidden_regions: Vec<Rect>,
    #[serde(default)]
    pub forbidden_mask: Option<ForbiddenMask>,
    pub min_width_ratio: f32,
    pub min_height_ratio: f32,
    pub max_candidates: usize,
    pub max_forbidden_iou: f32,
}

/// Output of the placement planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerResponse {
    /// Ranked candidates; a max-free-region candidate, when one exists,
    /// is prepended ahead of the ranked list.
    pub candidates: Vec<PlacementCandidate>,
    pub forbidden_bbox: Option<Rect>,
    pub forbidden_position: Option<ForbiddenPosition>,
}

/// Plan overlay placements for one image.
///
/// Pure function of its input; never returns an empty candidate list while
/// any candidate was generated at all (a lowest-occlusion fallback survives
/// total filtering). The max-free-region candidate is absent when forbidden
/// geometry leaves no rectangle meeting the minimum size constraints.
pub fn plan(req: &PlannerRequest) -> PlannerResponse {
    let forbidden: Vec<Rect> = req
        .forbidden_regions
        .iter()
        .map(|r| r.clamp_unit())
        .collect();

    let forbidden_bbox = match (bbox_of(&forbidden), req.forbidden_mask.as_ref().and_then(|m| m.bbox())) {
        (Some(a), Some(b)) => Some(a.union_bbox(&b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    };

    let mut raw = heuristic_candidates(req.min_width_ratio, req.min_height_ratio);
    if !forbidden.is_empty() || req.forbidden_mask.is_some() {
        raw.extend(grid_candidates(
            &forbidden,
            req.min_width_ratio,
            req.min_height_ratio,
        ));
    }

    let scored: Vec<PlacementCandidate> = raw
        .iter()
        .map(|c| score_candidate(c, &forbidden, req.forbidden_mask.as_ref()))
        .collect();

    let mut kept: Vec<PlacementCandidate> = scored
        .iter()
        .filter(|c| c.occlusion_iou <= req.max_forbidden_iou)
        .cloned()
        .collect();

    // Never empty while anything was generated: keep the globally least
    // occluded candidate when the filter removed everything.
    if kept.is_empty() {
        if let Some(best) = scored.iter().min_by(|a, b| {
            a.occlusion_iou
                .partial_cmp(&b.occlusion_iou)
                .unwrap_or(std::cmp::Ordering::Equal)
        }) {
            kept.push(best.clone());
        }
    }

    let mut ranked = diversify(kept, req.max_candidates);

    if let Some(free) = max_free_region(
        forbidden_bbox,
        &forbidden,
        req.forbidden_mask.as_ref(),
        req.min_width_ratio,
        req.min_height_ratio,
    ) {
        ranked.insert(0, free);
    }

    debug!(
        candidates = ranked.len(),
        forbidden_boxes = forbidden.len(),
        has_mask = req.forbidden_mask.is_some(),
        "placement plan computed"
    );
    metrics::histogram!("planner.candidates").record(ranked.len() as f64);

    PlannerResponse {
        candidates: ranked,
        forbidden_bbox,
        forbidden_position: forbidden_bbox.map(position_summary),
    }
}

/// Occlusion IoU of a candidate: max of box-vs-box IoU over every forbidden
/// box and the raster-mask IoU when a mask is supplied.
fn occlusion_iou(rect: &Rect, forbidden: &[Rect], mask: Option<&ForbiddenMask>) -> f32 {
    let box_iou = forbidden
        .iter()
        .map(|f| rect.iou(f))
        .fold(0.0f32, f32::max);
    let mask_iou = mask.map(|m| m.iou_with_rect(rect)).unwrap_or(0.0);
    box_iou.max(mask_iou)
}

fn score_candidate(
    raw: &RawCandidate,
    forbidden: &[Rect],
    mask: Option<&ForbiddenMask>,
) -> PlacementCandidate {
    let iou = occlusion_iou(&raw.rect, forbidden, mask);
    PlacementCandidate {
        id: Uuid::new_v4(),
        x: raw.rect.x,
        y: raw.rect.y,
        w: raw.rect.w,
        h: raw.rect.h,
        score: raw.base_score * (1.0 - iou),
        source: if raw.from_grid {
            CandidateSource::GridSearch
        } else {
            CandidateSource::HeuristicAnchor
        },
        occlusion_iou: iou,
    }
}

fn bucket_key(c: &PlacementCandidate) -> (i32, i32) {
    ((c.w * 10.0).round() as i32, (c.h * 10.0).round() as i32)
}

/// True when `a` and `b` are near-duplicate placements: centers closer than
/// 30% of the larger candidate's extent on both axes.
fn near_duplicate(a: &PlacementCandidate, b: &PlacementCandidate) -> bool {
    let (ax, ay) = a.rect().center();
    let (bx, by) = b.rect().center();
    let max_w = a.w.max(b.w);
    let max_h = a.h.max(b.h);
    (ax - bx).abs() < DEDUP_CENTER_FRACTION * max_w && (ay - by).abs() < DEDUP_CENTER_FRACTION * max_h
}

/// Group candidates by rounded size, suppress near-duplicates within each
/// bucket (keeping the highest score), then interleave across buckets up to
/// `max_candidates`.
fn diversify(candidates: Vec<PlacementCandidate>, max_candidates: usize) -> Vec<PlacementCandidate> {
    let mut buckets: Vec<((i32, i32), Vec<PlacementCandidate>)> = Vec::new();
    for c in candidates {
        let key = bucket_key(&c);
        match buckets.iter_mut().find(|(k, _)| *k == key) {
            Some((_, bucket)) => bucket.push(c),
            None => buckets.push((key, vec![c])),
        }
    }

    for (_, bucket) in buckets.iter_mut() {
        bucket.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        let mut deduped: Vec<PlacementCandidate> = Vec::new();
        for c in bucket.drain(..) {
            if !deduped.iter().any(|kept| near_duplicate(kept, &c)) {
                deduped.push(c);
            }
        }
        *bucket = deduped;
    }

    // Strongest buckets lead the interleave.
    buckets.sort_by(|(_, a), (_, b)| {
        let sa = a.first().map(|c| c.score).unwrap_or(0.0);
        let sb = b.first().map(|c| c.score).unwrap_or(0.0);
        sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut out = Vec::new();
    let mut depth = 0usize;
    while out.len() < max_candidates {
        let mut took_any = false;
        for (_, bucket) in buckets.iter() {
            if let Some(c) = bucket.get(depth) {
                out.push(c.clone());
                took_any = true;
                if out.len() == max_candidates {
                    break;
                }
            }
        }
        if !took_any {
            break;
        }
        depth += 1;
    }
    out
}

/// Search the four half-plane strips around the forbidden bounding box for
/// the largest rectangle with zero occlusion against all forbidden geometry.
fn max_free_region(
    forbidden_bbox: Option<Rect>,
    forbidden: &[Rect],
    mask: Option<&ForbiddenMask>,
    min_w: f32,
    min_h: f32,
) -> Option<PlacementCandidate> {
    let fbox = forbidden_bbox?;
    let m = FREE_REGION_MARGIN;

    let strips = [
        Rect::new(0.0, 0.0, 1.0, fbox.y - m),                       // above
        Rect::new(0.0, fbox.y2() + m, 1.0, 1.0 - fbox.y2() - m),    // below
        Rect::new(0.0, 0.0, fbox.x - m, 1.0),                       // left
        Rect::new(fbox.x2() + m, 0.0, 1.0 - fbox.x2() - m, 1.0),    // right
    ];

    strips
        .iter()
        .filter(|s| s.w >= min_w && s.h >= min_h)
        .map(|s| s.clamp_unit())
        .filter(|s| occlusion_iou(s, forbidden, mask) == 0.0)
        .max_by(|a, b| a.area().partial_cmp(&b.area()).unwrap_or(std::cmp::Ordering::Equal))
        .map(|r| PlacementCandidate {
            id: Uuid::new_v4(),
            x: r.x,
            y: r.y,
            w: r.w,
            h: r.h,
            score: 1.0,
            source: CandidateSource::MaxFreeRegion,
            occlusion_iou: 0.0,
        })
}

fn position_summary(bbox: Rect) -> ForbiddenPosition {
    let (cx, cy) = bbox.center();
    let x = if cx < 1.0 / 3.0 {
        HorizontalPos::Left
    } else if cx < 2.0 / 3.0 {
        HorizontalPos::Center
    } else {
        HorizontalPos::Right
    };
    let y = if cy < 1.0 / 3.0 {
        VerticalPos::Top
    } else if cy < 2.0 / 3.0 {
        VerticalPos::Middle
    } else {
        VerticalPos::Bottom
    };
    ForbiddenPosition { x, y }
}
