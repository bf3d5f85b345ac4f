//! Overlay placement planning for generated ad creatives.
//!
//! Pure geometry: given image dimensions, forbidden regions (boxes and an
//! optional raster mask) and sizing constraints, proposes a ranked,
//! diversity-filtered list of candidate overlay regions plus an optional
//! maximum free region.

pub mod candidates;
pub mod geometry;
pub mod planner;

pub use geometry::{ForbiddenMask, Rect};
pub use planner::{
    plan, CandidateSource, ForbiddenPosition, HorizontalPos, PlacementCandidate, PlannerRequest,
    PlannerResponse, VerticalPos,
};
