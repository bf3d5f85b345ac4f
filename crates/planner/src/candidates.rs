//! Candidate region generation: fixed heuristic anchors plus a forbidden-
//! aware grid of anchor positions.

use crate::geometry::{bbox_of, Rect};

/// A raw candidate before occlusion scoring.
#[derive(Debug, Clone, Copy)]
pub struct RawCandidate {
    pub rect: Rect,
    pub base_score: f32,
    pub from_grid: bool,
}

/// Fixed banner/side-bar anchors used regardless of forbidden geometry.
/// Scores encode a mild preference for top and bottom banners.
const HEURISTIC_ANCHORS: [(f32, f32, f32, f32, f32); 5] = [
    // x, y, w, h, base score
    (0.05, 0.04, 0.90, 0.16, 0.90), // top banner
    (0.05, 0.80, 0.90, 0.16, 0.85), // bottom banner
    (0.04, 0.20, 0.26, 0.60, 0.70), // left side bar
    (0.70, 0.20, 0.26, 0.60, 0.70), // right side bar
    (0.10, 0.40, 0.80, 0.20, 0.60), // centered band
];

/// Candidate sizes tried at each grid anchor position, as (w, h) ratios.
const GRID_SIZES: [(f32, f32); 5] = [
    (0.80, 0.15),
    (0.60, 0.20),
    (0.40, 0.30),
    (0.30, 0.40),
    (0.25, 0.55),
];

/// Margin kept between grid placements and the image border.
const GRID_MARGIN: f32 = 0.02;

/// The fixed heuristic anchor set, filtered by the minimum size ratios.
pub fn heuristic_candidates(min_w: f32, min_h: f32) -> Vec<RawCandidate> {
    HEURISTIC_ANCHORS
        .iter()
        .filter(|(_, _, w, h, _)| *w >= min_w && *h >= min_h)
        .map(|&(x, y, w, h, score)| RawCandidate {
            rect: Rect::new(x, y, w, h),
            base_score: score,
            from_grid: false,
        })
        .collect()
}

/// Grid candidates: corners, edge midpoints and center, each tried at the
/// fixed size list, biased away from the forbidden union by scoring down
/// placements whose center falls inside the forbidden bounding box.
pub fn grid_candidates(forbidden: &[Rect], min_w: f32, min_h: f32) -> Vec<RawCandidate> {
    let fbox = bbox_of(forbidden);
    let mut out = Vec::new();

    // (ax, ay) anchor factors: 0 hugs the low edge, 1 the high edge.
    let anchor_factors = [0.0, 0.5, 1.0];

    for &(w, h) in GRID_SIZES.iter() {
        if w < min_w || h < min_h {
            continue;
        }
        let span_x = 1.0 - w - 2.0 * GRID_MARGIN;
        let span_y = 1.0 - h - 2.0 * GRID_MARGIN;
        if span_x < 0.0 || span_y < 0.0 {
            continue;
        }
        for &ax in anchor_factors.iter() {
            for &ay in anchor_factors.iter() {
                let rect = Rect::new(GRID_MARGIN + ax * span_x, GRID_MARGIN + ay * span_y, w, h)
                    .clamp_unit();
                let mut score = 0.50;
                if let Some(fb) = fbox {
                    let (cx, cy) = rect.center();
                    let inside = cx >= fb.x && cx <= fb.x2() && cy >= fb.y && cy <= fb.y2();
                    if inside {
                        score *= 0.5;
                    }
                }
                out.push(RawCandidate {
                    rect,
                    base_score: score,
                    from_grid: true,
                });
            }
        }
    }
    out
}
