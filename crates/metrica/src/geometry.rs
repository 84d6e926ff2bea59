//! Page geometry shared by the tokenizer and both extractors.
//!
//! Token boxes live in source-image pixels; templates and zones use
//! coordinates normalized to the page (0.0 top/left, 1.0 bottom/right).

use serde::{Deserialize, Serialize};

/// Axis-aligned box in source-image pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self {
            x,
            y,
            w: w.max(0.0),
            h: h.max(0.0),
        }
    }

    pub fn right(&self) -> f32 {
        self.x + self.w
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.h
    }

    pub fn center_x(&self) -> f32 {
        self.x + self.w / 2.0
    }

    pub fn center_y(&self) -> f32 {
        self.y + self.h / 2.0
    }

    pub fn area(&self) -> f32 {
        self.w * self.h
    }

    /// Smallest box covering both.
    pub fn union(&self, other: &BBox) -> BBox {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        BBox::new(
            x,
            y,
            self.right().max(other.right()) - x,
            self.bottom().max(other.bottom()) - y,
        )
    }

    pub fn normalized(&self, page_width: u32, page_height: u32) -> NormRect {
        let pw = page_width.max(1) as f32;
        let ph = page_height.max(1) as f32;
        NormRect::new(self.x / pw, self.y / ph, self.right() / pw, self.bottom() / ph)
    }
}

/// Rectangle in normalized page coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormRect {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl NormRect {
    pub const PAGE: NormRect = NormRect {
        x0: 0.0,
        y0: 0.0,
        x1: 1.0,
        y1: 1.0,
    };

    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self {
            x0: x0.min(x1),
            y0: y0.min(y1),
            x1: x0.max(x1),
            y1: y0.max(y1),
        }
    }

    /// Clamps to the page.
    pub fn clamped(&self) -> Self {
        Self::new(
            self.x0.clamp(0.0, 1.0),
            self.y0.clamp(0.0, 1.0),
            self.x1.clamp(0.0, 1.0),
            self.y1.clamp(0.0, 1.0),
        )
    }

    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x0 + self.x1) / 2.0, (self.y0 + self.y1) / 2.0)
    }

    pub fn contains_point(&self, x: f32, y: f32) -> bool {
        x >= self.x0 && x <= self.x1 && y >= self.y0 && y <= self.y1
    }

    pub fn intersection_area(&self, other: &NormRect) -> f32 {
        let w = (self.x1.min(other.x1) - self.x0.max(other.x0)).max(0.0);
        let h = (self.y1.min(other.y1) - self.y0.max(other.y0)).max(0.0);
        w * h
    }

    /// Fraction of `self` lying inside `zone`. Degenerate boxes fall back to
    /// a center-point test.
    pub fn coverage_in(&self, zone: &NormRect) -> f32 {
        let area = self.area();
        if area <= f32::EPSILON {
            let (cx, cy) = self.center();
            return if zone.contains_point(cx, cy) { 1.0 } else { 0.0 };
        }
        self.intersection_area(zone) / area
    }

    /// Euclidean gap between the two rectangles (0 when they touch).
    pub fn distance_to(&self, other: &NormRect) -> f32 {
        let dx = (other.x0 - self.x1).max(self.x0 - other.x1).max(0.0);
        let dy = (other.y0 - self.y1).max(self.y0 - other.y1).max(0.0);
        (dx * dx + dy * dy).sqrt()
    }
}
