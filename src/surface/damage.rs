//! Damage tracking for output buffers
//!
//! Guest damage arrives in surface coordinates and has two consumers:
//!
//! 1. every output buffer owned by the surface accumulates it, so a buffer
//!    coming back from the host is refreshed before it is shown again;
//! 2. the host surface receives an expanded, scaled copy.
//!
//! # Example
//!
//! ```
//! use crossway::surface::damage::{BufferDamage, DamageRect};
//!
//! let mut damage = BufferDamage::empty();
//! damage.add(DamageRect::from_xywh(10, 10, 50, 50));
//! assert!(damage.has_damage());
//! ```

/// Lower bound applied to damage coordinates before scaling.
pub const MIN_SIZE: i64 = (i32::MIN / 10) as i64;
/// Upper bound applied to damage coordinates before scaling.
pub const MAX_SIZE: i64 = (i32::MAX / 10) as i64;

/// Maximum number of rectangles per buffer before coalescing to a bounding box
const MAX_DAMAGE_RECTS: usize = 16;

/// An axis-aligned rectangle stored as corners.
///
/// Corners are `i64` so that expanding a rectangle at the edge of the
/// representable range never overflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DamageRect {
    pub x1: i64,
    pub y1: i64,
    pub x2: i64,
    pub y2: i64,
}

impl DamageRect {
    pub fn new(x1: i64, y1: i64, x2: i64, y2: i64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn from_xywh(x: i32, y: i32, width: i32, height: i32) -> Self {
        let x1 = x as i64;
        let y1 = y as i64;
        Self {
            x1,
            y1,
            x2: x1 + width as i64,
            y2: y1 + height as i64,
        }
    }

    /// The whole addressable surface.
    pub fn everything() -> Self {
        Self::new(0, 0, MAX_SIZE, MAX_SIZE)
    }

    pub fn width(&self) -> i64 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i64 {
        self.y2 - self.y1
    }

    pub fn is_empty(&self) -> bool {
        self.x1 >= self.x2 || self.y1 >= self.y2
    }

    /// Checks if this rectangle shares any pixels with `other`
    pub fn intersects(&self, other: &DamageRect) -> bool {
        self.x1 < other.x2 && other.x1 < self.x2 && self.y1 < other.y2 && other.y1 < self.y2
    }

    /// Smallest rectangle containing both.
    pub fn union(&self, other: &DamageRect) -> DamageRect {
        DamageRect {
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
            x2: self.x2.max(other.x2),
            y2: self.y2.max(other.y2),
        }
    }

    pub fn intersection(&self, other: &DamageRect) -> Option<DamageRect> {
        if !self.intersects(other) {
            return None;
        }
        Some(DamageRect {
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
            x2: self.x2.min(other.x2),
            y2: self.y2.min(other.y2),
        })
    }

    pub fn contains(&self, other: &DamageRect) -> bool {
        other.x1 >= self.x1 && other.y1 >= self.y1 && other.x2 <= self.x2 && other.y2 <= self.y2
    }

    /// Convert to the `(x, y, width, height)` form used on the wire.
    pub fn to_xywh(&self) -> (i32, i32, i32, i32) {
        (
            clamp_i32(self.x1),
            clamp_i32(self.y1),
            clamp_i32(self.width()),
            clamp_i32(self.height()),
        )
    }
}

fn clamp_i32(v: i64) -> i32 {
    v.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

/// Host-space damage for a guest damage request.
///
/// The rectangle is outset by one pixel to cover filtering, clamped to
/// `[MIN_SIZE, MAX_SIZE]`, optionally clamped to the surface `bounds`, and
/// divided by `scale`. The origin truncates and the far corner rounds up, so
/// the result always encloses the scaled input.
pub fn host_damage(rect: DamageRect, scale: f64, bounds: Option<(i64, i64)>) -> DamageRect {
    let mut x1 = (rect.x1 - 1).max(MIN_SIZE);
    let mut y1 = (rect.y1 - 1).max(MIN_SIZE);
    let mut x2 = (rect.x2 + 1).min(MAX_SIZE);
    let mut y2 = (rect.y2 + 1).min(MAX_SIZE);

    if let Some((w, h)) = bounds {
        x1 = x1.max(0);
        y1 = y1.max(0);
        x2 = x2.min(w);
        y2 = y2.min(h);
    }

    DamageRect {
        x1: (x1 as f64 / scale) as i64,
        y1: (y1 as f64 / scale) as i64,
        x2: (x2 as f64 / scale).ceil() as i64,
        y2: (y2 as f64 / scale).ceil() as i64,
    }
}

/// Host-space rectangle for `wl_region.add` / `subtract`.
pub fn host_region_rect(x: i32, y: i32, width: i32, height: i32, scale: f64) -> (i32, i32, i32, i32) {
    let x1 = (x as f64 / scale) as i32;
    let y1 = (y as f64 / scale) as i32;
    let x2 = ((x as i64 + width as i64) as f64 / scale) as i32;
    let y2 = ((y as i64 + height as i64) as f64 / scale) as i32;
    (x1, y1, x2 - x1, y2 - y1)
}

/// Pending writes of one output buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferDamage {
    rects: Vec<DamageRect>,
}

impl BufferDamage {
    pub fn empty() -> Self {
        Self { rects: Vec::new() }
    }

    /// Damage covering everything, used for freshly allocated buffers.
    pub fn full() -> Self {
        Self {
            rects: vec![DamageRect::everything()],
        }
    }

    /// Adds a rectangle, merging it into an existing one when they overlap.
    ///
    /// Past `MAX_DAMAGE_RECTS` the set collapses to its bounding box.
    pub fn add(&mut self, rect: DamageRect) {
        if rect.is_empty() {
            return;
        }
        if self.rects.iter().any(|r| r.contains(&rect)) {
            return;
        }
        self.rects.retain(|r| !rect.contains(r));
        self.rects.push(rect);

        if self.rects.len() > MAX_DAMAGE_RECTS {
            let merged = self.rects.iter().skip(1).fold(self.rects[0], |acc, r| acc.union(r));
            self.rects.clear();
            self.rects.push(merged);
        }
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }

    pub fn has_damage(&self) -> bool {
        !self.rects.is_empty()
    }

    pub fn rects(&self) -> &[DamageRect] {
        &self.rects
    }

    /// Merges overlapping rectangles to reduce copy work
    pub fn merge_overlapping(&mut self) {
        if self.rects.len() <= 1 {
            return;
        }
        self.rects.sort_by_key(|r| (r.y1, r.x1));
        let mut merged: Vec<DamageRect> = Vec::with_capacity(self.rects.len());
        let mut current = self.rects[0];
        for r in &self.rects[1..] {
            if current.intersects(r) {
                current = current.union(r);
            } else {
                merged.push(current);
                current = *r;
            }
        }
        merged.push(current);
        self.rects = merged;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_union_and_intersection() {
        let a = DamageRect::from_xywh(0, 0, 100, 100);
        let b = DamageRect::from_xywh(50, 50, 100, 100);
        assert!(a.intersects(&b));
        assert_eq!(a.union(&b), DamageRect::new(0, 0, 150, 150));
        assert_eq!(a.intersection(&b), Some(DamageRect::new(50, 50, 100, 100)));
        let c = DamageRect::from_xywh(200, 200, 5, 5);
        assert!(a.intersection(&c).is_none());
    }

    #[test]
    fn test_host_damage_unit_scale() {
        let out = host_damage(DamageRect::from_xywh(0, 0, 100, 100), 1.0, None);
        assert_eq!(out.to_xywh(), (-1, -1, 102, 102));
    }

    #[test]
    fn test_host_damage_clamped_to_bounds() {
        let out = host_damage(DamageRect::from_xywh(0, 0, 100, 100), 1.0, Some((100, 100)));
        assert_eq!(out.to_xywh(), (0, 0, 100, 100));
    }

    #[test]
    fn test_host_damage_fractional_scale_rounds_outward() {
        // (10-1)/2 = 4.5 truncates to 4; (30+1)/2 = 15.5 rounds up to 16
        let out = host_damage(DamageRect::from_xywh(10, 10, 20, 20), 2.0, None);
        assert_eq!(out, DamageRect::new(4, 4, 16, 16));
    }

    #[test]
    fn test_host_damage_extreme_bounds() {
        let out = host_damage(
            DamageRect::new(i32::MIN as i64, i32::MIN as i64, i32::MAX as i64, i32::MAX as i64),
            1.0,
            None,
        );
        assert_eq!(out, DamageRect::new(MIN_SIZE, MIN_SIZE, MAX_SIZE, MAX_SIZE));
    }

    #[test]
    fn test_region_rect_scaled() {
        assert_eq!(host_region_rect(10, 20, 100, 50, 2.0), (5, 10, 50, 25));
    }

    #[test]
    fn test_buffer_damage_absorbs_contained_rects() {
        let mut d = BufferDamage::full();
        d.add(DamageRect::from_xywh(0, 0, 10, 10));
        assert_eq!(d.rects(), &[DamageRect::everything()]);
    }

    #[test]
    fn test_buffer_damage_coalesces_past_limit() {
        let mut d = BufferDamage::empty();
        for i in 0..20 {
            d.add(DamageRect::from_xywh(i * 20, 0, 10, 10));
        }
        assert_eq!(d.rects().len(), 4);
        assert!(d.rects().iter().any(|r| r.x1 == 0));
        assert!(d.rects().iter().any(|r| r.x2 == 390));
    }

    #[test]
    fn test_merge_overlapping() {
        let mut d = BufferDamage::empty();
        d.add(DamageRect::from_xywh(0, 0, 50, 50));
        d.add(DamageRect::from_xywh(40, 0, 50, 50));
        d.add(DamageRect::from_xywh(500, 500, 5, 5));
        d.merge_overlapping();
        assert_eq!(d.rects().len(), 2);
    }

    #[test]
    fn test_empty_rect_ignored() {
        let mut d = BufferDamage::empty();
        d.add(DamageRect::from_xywh(5, 5, 0, 10));
        assert!(!d.has_damage());
    }
}
