//! Normalized rectangle geometry and raster-mask occlusion.
//!
//! All rectangles are axis-aligned xywh in [0,1] image coordinates unless a
//! constructor says otherwise.

use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle in normalized image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    /// Convert a pixel-space xyxy box to a normalized xywh rectangle.
    pub fn from_pixel_xyxy(x1: f32, y1: f32, x2: f32, y2: f32, img_w: f32, img_h: f32) -> Self {
        Self {
            x: x1 / img_w,
            y: y1 / img_h,
            w: (x2 - x1) / img_w,
            h: (y2 - y1) / img_h,
        }
    }

    pub fn x2(&self) -> f32 {
        self.x + self.w
    }

    pub fn y2(&self) -> f32 {
        self.y + self.h
    }

    pub fn area(&self) -> f32 {
        (self.w.max(0.0)) * (self.h.max(0.0))
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    /// Clamp the rectangle into the unit square, preserving as much of its
    /// extent as fits.
    pub fn clamp_unit(&self) -> Self {
        let x = self.x.clamp(0.0, 1.0);
        let y = self.y.clamp(0.0, 1.0);
        Self {
            x,
            y,
            w: self.w.min(1.0 - x).max(0.0),
            h: self.h.min(1.0 - y).max(0.0),
        }
    }

    /// Area of the overlap with `other`, zero when disjoint.
    pub fn intersection_area(&self, other: &Rect) -> f32 {
        let ix = (self.x2().min(other.x2()) - self.x.max(other.x)).max(0.0);
        let iy = (self.y2().min(other.y2()) - self.y.max(other.y)).max(0.0);
        ix * iy
    }

    /// Intersection-over-union with `other`.
    pub fn iou(&self, other: &Rect) -> f32 {
        let inter = self.intersection_area(other);
        if inter <= 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Smallest rectangle covering both `self` and `other`.
    pub fn union_bbox(&self, other: &Rect) -> Rect {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        Rect {
            x,
            y,
            w: self.x2().max(other.x2()) - x,
            h: self.y2().max(other.y2()) - y,
        }
    }
}

/// Bounding box of a set of rectangles, `None` when empty.
pub fn bbox_of(rects: &[Rect]) -> Option<Rect> {
    let mut iter = rects.iter();
    let first = *iter.next()?;
    Some(iter.fold(first, |acc, r| acc.union_bbox(r)))
}

/// Row-major binary raster marking forbidden pixels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForbiddenMask {
    pub width: u32,
    pub height: u32,
    pub data: Vec<bool>,
}

impl ForbiddenMask {
    pub fn new(width: u32, height: u32, data: Vec<bool>) -> Self {
        debug_assert_eq!(data.len(), (width * height) as usize);
        Self {
            width,
            height,
            data,
        }
    }

    /// Masks arrive over the wire and may carry fewer than `width*height`
    /// entries; out-of-range pixels read as unset.
    fn at(&self, px: u32, py: u32) -> bool {
        self.data
            .get((py * self.width + px) as usize)
            .copied()
            .unwrap_or(false)
    }

    /// Normalized bounding box of the set pixels, `None` for an empty mask.
    pub fn bbox(&self) -> Option<Rect> {
        let (mut min_x, mut min_y) = (u32::MAX, u32::MAX);
        let (mut max_x, mut max_y) = (0u32, 0u32);
        let mut any = false;
        for py in 0..self.height {
            for px in 0..self.width {
                if self.at(px, py) {
                    any = true;
                    min_x = min_x.min(px);
                    min_y = min_y.min(py);
                    max_x = max_x.max(px);
                    max_y = max_y.max(py);
                }
            }
        }
        if !any {
            return None;
        }
        Some(Rect {
            x: min_x as f32 / self.width as f32,
            y: min_y as f32 / self.height as f32,
            w: (max_x - min_x + 1) as f32 / self.width as f32,
            h: (max_y - min_y + 1) as f32 / self.height as f32,
        })
    }

    /// Intersection-over-union between a normalized rectangle and the set
    /// pixels of the mask, computed in the mask's raster grid.
    pub fn iou_with_rect(&self, rect: &Rect) -> f32 {
        let rect = rect.clamp_unit();
        let x1 = (rect.x * self.width as f32).floor().max(0.0) as u32;
        let y1 = (rect.y * self.height as f32).floor().max(0.0) as u32;
        let x2 = (rect.x2() * self.width as f32).ceil().min(self.width as f32) as u32;
        let y2 = (rect.y2() * self.height as f32).ceil().min(self.height as f32) as u32;

        let mut mask_pixels = 0u64;
        let mut inter = 0u64;
        for py in 0..self.height {
            for px in 0..self.width {
                if self.at(px, py) {
                    mask_pixels += 1;
                    if px >= x1 && px < x2 && py >= y1 && py < y2 {
                        inter += 1;
                    }
                }
            }
        }
        let rect_pixels = ((x2.saturating_sub(x1)) as u64) * ((y2.saturating_sub(y1)) as u64);
        let union = mask_pixels + rect_pixels - inter;
        if union == 0 {
            0.0
        } else {
            inter as f32 / union as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_xyxy_normalization() {
        let r = Rect::from_pixel_xyxy(400.0, 400.0, 600.0, 600.0, 1000.0, 1000.0);
        assert!((r.x - 0.4).abs() < 1e-6);
        assert!((r.y - 0.4).abs() < 1e-6);
        assert!((r.w - 0.2).abs() < 1e-6);
        assert!((r.h - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint_and_identical() {
        let a = Rect::new(0.1, 0.05, 0.8, 0.18);
        let b = Rect::new(0.4, 0.4, 0.2, 0.2);
        assert_eq!(a.iou(&b), 0.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_half_overlap() {
        let a = Rect::new(0.0, 0.0, 0.4, 0.4);
        let b = Rect::new(0.2, 0.0, 0.4, 0.4);
        // intersection 0.08, union 0.24
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_bbox_of_union() {
        let bbox = bbox_of(&[Rect::new(0.1, 0.1, 0.2, 0.2), Rect::new(0.6, 0.5, 0.3, 0.4)])
            .unwrap();
        assert!((bbox.x - 0.1).abs() < 1e-6);
        assert!((bbox.y - 0.1).abs() < 1e-6);
        assert!((bbox.x2() - 0.9).abs() < 1e-6);
        assert!((bbox.y2() - 0.9).abs() < 1e-6);
        assert!(bbox_of(&[]).is_none());
    }

    #[test]
    fn test_mask_bbox_and_iou() {
        // 10x10 mask with a 4x4 block set at (2,2)..(6,6).
        let mut data = vec![false; 100];
        for py in 2..6 {
            for px in 2..6 {
                data[py * 10 + px] = true;
            }
        }
        let mask = ForbiddenMask::new(10, 10, data);
        let bbox = mask.bbox().unwrap();
        assert!((bbox.x - 0.2).abs() < 1e-6);
        assert!((bbox.w - 0.4).abs() < 1e-6);

        // Rect covering exactly the block.
        let exact = Rect::new(0.2, 0.2, 0.4, 0.4);
        assert!((mask.iou_with_rect(&exact) - 1.0).abs() < 1e-6);

        // Disjoint rect.
        let off = Rect::new(0.7, 0.7, 0.2, 0.2);
        assert_eq!(mask.iou_with_rect(&off), 0.0);
    }

    #[test]
    fn test_undersized_mask_data_reads_as_unset() {
        // Only one entry for a 10x10 raster: pixel (0,0) set, the rest unset.
        let mask = ForbiddenMask {
            width: 10,
            height: 10,
            data: vec![true],
        };
        let bbox = mask.bbox().unwrap();
        assert!(bbox.x.abs() < 1e-6);
        assert!((bbox.w - 0.1).abs() < 1e-6);
        assert_eq!(mask.iou_with_rect(&Rect::new(0.5, 0.5, 0.4, 0.4)), 0.0);
    }

    #[test]
    fn test_empty_mask_has_no_bbox() {
        let mask = ForbiddenMask::new(4, 4, vec![false; 16]);
        assert!(mask.bbox().is_none());
        assert_eq!(mask.iou_with_rect(&Rect::new(0.0, 0.0, 1.0, 1.0)), 0.0);
    }
}
