//! Coordinate conversion between the model's box convention and storage.
//!
//! Vision models report bounding boxes on a fixed 0–1000 grid regardless of
//! the page's real size. Diagrams are persisted as percentages (0–100) so a
//! consumer can overlay them on any rendition of the page. Cropping needs a
//! third form: integer pixels on the rendered raster.
//!
//! ```text
//! model box (0–1000) ──to_storage_scale──▶ Rect (0–100) ──to_pixel_rect──▶ PixelRect
//! ```
//!
//! Everything here is pure and total: bad input is clamped, never rejected.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound of the storage (percentage) scale.
pub const STORAGE_MAX: f64 = 100.0;

/// Upper bound of the model's box scale.
pub const INFERENCE_MAX: f64 = 1000.0;

/// Which coordinate convention a [`Rect`] is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scale {
    /// Model convention, 0–[`INFERENCE_MAX`].
    Inference,
    /// Storage convention, percentages 0–[`STORAGE_MAX`].
    Storage,
}

impl Scale {
    pub fn max(self) -> f64 {
        match self {
            Scale::Inference => INFERENCE_MAX,
            Scale::Storage => STORAGE_MAX,
        }
    }
}

/// Axis-aligned rectangle tagged with its scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
    pub scale: Scale,
}

impl Rect {
    pub fn new(x_min: f64, y_min: f64, x_max: f64, y_max: f64, scale: Scale) -> Self {
        Self {
            x_min,
            y_min,
            x_max,
            y_max,
            scale,
        }
    }

    /// Vertical centre in the rectangle's own scale.
    pub fn center_y(&self) -> f64 {
        (self.y_min + self.y_max) / 2.0
    }

    pub fn width(&self) -> f64 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> f64 {
        self.y_max - self.y_min
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({:.1},{:.1})-({:.1},{:.1})/{:?}",
            self.x_min, self.y_min, self.x_max, self.y_max, self.scale
        )
    }
}

/// Integer pixel rectangle on a rendered page, half-open on the max side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x_min: u32,
    pub y_min: u32,
    pub x_max: u32,
    pub y_max: u32,
}

impl PixelRect {
    pub fn width(&self) -> u32 {
        self.x_max.saturating_sub(self.x_min)
    }

    pub fn height(&self) -> u32 {
        self.y_max.saturating_sub(self.y_min)
    }
}

/// Rescale `rect` from a `source_max` grid to storage percentages.
///
/// Each bound is divided by `source_max / 100`, clamped to `[0, 100]`, and
/// inverted bounds are swapped so `min <= max` holds on both axes. A
/// non-positive or non-finite `source_max` is treated as already-storage.
pub fn to_storage_scale(rect: &Rect, source_max: f64) -> Rect {
    let factor = if source_max.is_finite() && source_max > 0.0 {
        source_max / STORAGE_MAX
    } else {
        1.0
    };

    let x0 = clamp_pct(rect.x_min / factor);
    let x1 = clamp_pct(rect.x_max / factor);
    let y0 = clamp_pct(rect.y_min / factor);
    let y1 = clamp_pct(rect.y_max / factor);

    Rect::new(x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1), Scale::Storage)
}

fn clamp_pct(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, STORAGE_MAX)
    }
}

/// Convert a storage-scale rectangle into a padded pixel crop on a page.
///
/// Bounds are multiplied by the page size, grown by `padding_px` on every
/// side and clamped to the page. The result always spans at least one pixel
/// on each axis when the page itself is non-empty. A rectangle that is still
/// on the inference grid is rescaled first.
pub fn to_pixel_rect(rect: &Rect, width_px: u32, height_px: u32, padding_px: u32) -> PixelRect {
    let pct = match rect.scale {
        Scale::Storage => *rect,
        Scale::Inference => to_storage_scale(rect, INFERENCE_MAX),
    };

    let (x_min, x_max) = axis_span(pct.x_min, pct.x_max, width_px, padding_px);
    let (y_min, y_max) = axis_span(pct.y_min, pct.y_max, height_px, padding_px);

    PixelRect {
        x_min,
        y_min,
        x_max,
        y_max,
    }
}

fn axis_span(lo_pct: f64, hi_pct: f64, size_px: u32, padding_px: u32) -> (u32, u32) {
    if size_px == 0 {
        return (0, 0);
    }
    let size = size_px as f64;
    let pad = padding_px as f64;

    let lo = (clamp_pct(lo_pct) * size / STORAGE_MAX - pad).floor().max(0.0);
    let hi = (clamp_pct(hi_pct) * size / STORAGE_MAX + pad).ceil().min(size);

    let (lo, hi) = (lo as u32, hi as u32);
    if hi > lo {
        (lo, hi)
    } else if lo >= size_px {
        (size_px - 1, size_px)
    } else {
        (lo, lo + 1)
    }
}

// ── Vertical bands ───────────────────────────────────────────────────────

/// Coarse vertical position on a page, used by the nearest-question fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    Top,
    Middle,
    Bottom,
}

impl Band {
    /// Band containing a vertical coordinate expressed in storage percent.
    pub fn from_storage_y(y_pct: f64) -> Self {
        if y_pct < STORAGE_MAX / 3.0 {
            Band::Top
        } else if y_pct < STORAGE_MAX * 2.0 / 3.0 {
            Band::Middle
        } else {
            Band::Bottom
        }
    }

    /// Band for the `index`-th of `count` items laid out top to bottom.
    pub fn from_order(index: usize, count: usize) -> Self {
        if count <= 1 {
            return Band::Top;
        }
        match index * 3 / count {
            0 => Band::Top,
            1 => Band::Middle,
            _ => Band::Bottom,
        }
    }

    /// Parse a free-form position hint ("top", "upper half", "bottom" …).
    pub fn parse(hint: &str) -> Option<Self> {
        let h = hint.trim().to_ascii_lowercase();
        if h.contains("top") || h.contains("upper") {
            Some(Band::Top)
        } else if h.contains("mid") || h.contains("centre") || h.contains("center") {
            Some(Band::Middle)
        } else if h.contains("bottom") || h.contains("lower") {
            Some(Band::Bottom)
        } else {
            None
        }
    }

    /// Number of bands between `self` and `other` (0, 1 or 2).
    pub fn distance(self, other: Band) -> u8 {
        (self.rank() as i8 - other.rank() as i8).unsigned_abs()
    }

    fn rank(self) -> u8 {
        match self {
            Band::Top => 0,
            Band::Middle => 1,
            Band::Bottom => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inference(x0: f64, y0: f64, x1: f64, y1: f64) -> Rect {
        Rect::new(x0, y0, x1, y1, Scale::Inference)
    }

    #[test]
    fn rescales_model_box_to_percent() {
        let r = to_storage_scale(&inference(50.0, 200.0, 300.0, 400.0), 1000.0);
        assert_eq!(r, Rect::new(5.0, 20.0, 30.0, 40.0, Scale::Storage));
    }

    #[test]
    fn clamps_and_swaps() {
        let r = to_storage_scale(&inference(1200.0, -40.0, 900.0, 500.0), 1000.0);
        assert_eq!(r.x_min, 90.0);
        assert_eq!(r.x_max, 100.0);
        assert_eq!(r.y_min, 0.0);
        assert_eq!(r.y_max, 50.0);
    }

    #[test]
    fn nan_bounds_collapse_to_zero() {
        let r = to_storage_scale(&inference(f64::NAN, 0.0, 10.0, f64::NAN), 1000.0);
        assert!(r.x_min >= 0.0 && r.x_max <= 100.0);
        assert!(r.y_min <= r.y_max);
    }

    #[test]
    fn storage_scale_is_monotonic() {
        let inner = to_storage_scale(&inference(100.0, 100.0, 200.0, 200.0), 1000.0);
        let outer = to_storage_scale(&inference(50.0, 80.0, 260.0, 1400.0), 1000.0);
        assert!(outer.x_min <= inner.x_min && outer.y_min <= inner.y_min);
        assert!(outer.x_max >= inner.x_max && outer.y_max >= inner.y_max);
    }

    #[test]
    fn bounds_always_in_range() {
        for &(a, b, c, d) in &[
            (0.0, 0.0, 1000.0, 1000.0),
            (-5.0, 2000.0, 30.0, -1.0),
            (999.9, 999.9, 999.9, 999.9),
        ] {
            let r = to_storage_scale(&inference(a, b, c, d), 1000.0);
            for v in [r.x_min, r.y_min, r.x_max, r.y_max] {
                assert!((0.0..=100.0).contains(&v), "{v} out of range");
            }
            assert!(r.x_min <= r.x_max && r.y_min <= r.y_max);
        }
    }

    #[test]
    fn pixel_rect_pads_and_clamps() {
        let pct = Rect::new(5.0, 20.0, 30.0, 40.0, Scale::Storage);
        let px = to_pixel_rect(&pct, 1000, 1000, 10);
        assert_eq!(
            px,
            PixelRect {
                x_min: 40,
                y_min: 190,
                x_max: 310,
                y_max: 410
            }
        );

        let edge = Rect::new(0.0, 95.0, 100.0, 100.0, Scale::Storage);
        let px = to_pixel_rect(&edge, 800, 600, 25);
        assert_eq!(px.x_min, 0);
        assert_eq!(px.x_max, 800);
        assert_eq!(px.y_max, 600);
    }

    #[test]
    fn degenerate_rect_gets_one_pixel() {
        let point = Rect::new(50.0, 50.0, 50.0, 50.0, Scale::Storage);
        let px = to_pixel_rect(&point, 200, 100, 0);
        assert_eq!(px.width(), 1);
        assert_eq!(px.height(), 1);

        let corner = Rect::new(100.0, 100.0, 100.0, 100.0, Scale::Storage);
        let px = to_pixel_rect(&corner, 200, 100, 0);
        assert_eq!((px.x_min, px.x_max), (199, 200));
        assert_eq!((px.y_min, px.y_max), (99, 100));
    }

    #[test]
    fn inference_rect_is_rescaled_before_cropping() {
        let px = to_pixel_rect(&inference(50.0, 200.0, 300.0, 400.0), 1000, 1000, 0);
        assert_eq!((px.x_min, px.y_min, px.x_max, px.y_max), (50, 200, 300, 400));
    }

    #[test]
    fn bands() {
        assert_eq!(Band::from_storage_y(10.0), Band::Top);
        assert_eq!(Band::from_storage_y(50.0), Band::Middle);
        assert_eq!(Band::from_storage_y(90.0), Band::Bottom);
        assert_eq!(Band::from_order(0, 3), Band::Top);
        assert_eq!(Band::from_order(1, 3), Band::Middle);
        assert_eq!(Band::from_order(2, 3), Band::Bottom);
        assert_eq!(Band::from_order(0, 1), Band::Top);
        assert_eq!(Band::parse("Lower half"), Some(Band::Bottom));
        assert_eq!(Band::parse("sideways"), None);
        assert_eq!(Band::Top.distance(Band::Bottom), 2);
        assert_eq!(Band::Middle.distance(Band::Middle), 0);
    }
}
