//! Dark scanner borders along the page edges.
//!
//! A border is a run of edge rows or columns that are both dark and flat.
//! Detection runs on a copy scaled to at most 800 px wide; the crop is
//! returned in full-resolution pixels.

use image::imageops::{self, FilterType};
use image::GrayImage;

const ANALYSIS_WIDTH: u32 = 800;
const MAX_SCAN_DEPTH: f32 = 200.0;
const SCAN_DEPTH_RATIO: f32 = 0.18;
const BLACK_LEVEL: f64 = 40.0;
const MAX_BAND_VARIANCE: f64 = 600.0;
const MIN_BAND_PX: u32 = 12;
/// Crops below this size are refused.
const MIN_CROP_PX: u32 = 64;
const MIN_CONFIDENCE: f32 = 0.70;
const HIGH_CONFIDENCE: f32 = 0.85;
const MAX_SIDE_TRIM: f32 = 0.20;
const MAX_AXIS_TRIM: f32 = 0.08;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Trim {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

impl Trim {
    fn edges(&self) -> usize {
        [self.left, self.right, self.top, self.bottom]
            .iter()
            .filter(|&&t| t > 0)
            .count()
    }
}

/// Region to keep after removing the border.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BorderCrop {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub trim: Trim,
    pub confidence: f32,
}

#[derive(Clone, Copy)]
enum Edge {
    Left,
    Right,
    Top,
    Bottom,
}

/// Finds a removable border, or `None` when the page has none or the
/// detection is not trustworthy enough to crop.
pub fn detect_border(gray: &GrayImage) -> Option<BorderCrop> {
    let (w, h) = gray.dimensions();
    if w == 0 || h == 0 {
        return None;
    }

    let analysis_w = w.min(ANALYSIS_WIDTH);
    let scale = w as f32 / analysis_w as f32;
    let small = if analysis_w == w {
        gray.clone()
    } else {
        let analysis_h = ((h as f32 / scale).round() as u32).max(1);
        imageops::resize(gray, analysis_w, analysis_h, FilterType::Triangle)
    };

    let depth_px = (SCAN_DEPTH_RATIO * w.min(h) as f32).min(MAX_SCAN_DEPTH);
    let depth = ((depth_px / scale).round() as u32).max(1);
    let to_px = |strips: u32| {
        let px = (strips as f32 * scale).round() as u32;
        if px < MIN_BAND_PX {
            0
        } else {
            px
        }
    };
    let raw = Trim {
        left: to_px(band_depth(&small, Edge::Left, depth)),
        right: to_px(band_depth(&small, Edge::Right, depth)),
        top: to_px(band_depth(&small, Edge::Top, depth)),
        bottom: to_px(band_depth(&small, Edge::Bottom, depth)),
    };
    if raw == Trim::default() {
        return None;
    }

    let confidence = confidence(&raw, w, h);
    if confidence < MIN_CONFIDENCE {
        tracing::debug!(confidence, "Border detection below confidence, not cropping");
        return None;
    }

    let trim = clamp_trim(raw, w, h, confidence);
    let width = w.saturating_sub(trim.left + trim.right);
    let height = h.saturating_sub(trim.top + trim.bottom);
    if width < MIN_CROP_PX || height < MIN_CROP_PX {
        return None;
    }
    Some(BorderCrop {
        x: trim.left,
        y: trim.top,
        width,
        height,
        trim,
        confidence,
    })
}

/// Number of consecutive dark, flat lines starting at `edge`.
fn band_depth(img: &GrayImage, edge: Edge, depth: u32) -> u32 {
    let (w, h) = img.dimensions();
    let limit = match edge {
        Edge::Left | Edge::Right => depth.min(w),
        Edge::Top | Edge::Bottom => depth.min(h),
    };
    let mut band = 0;
    for strip in 0..limit {
        let (mean, variance) = match edge {
            Edge::Left => line_stats((0..h).map(|y| img.get_pixel(strip, y)[0])),
            Edge::Right => line_stats((0..h).map(|y| img.get_pixel(w - 1 - strip, y)[0])),
            Edge::Top => line_stats((0..w).map(|x| img.get_pixel(x, strip)[0])),
            Edge::Bottom => line_stats((0..w).map(|x| img.get_pixel(x, h - 1 - strip)[0])),
        };
        if mean < BLACK_LEVEL && variance < MAX_BAND_VARIANCE {
            band = strip + 1;
        } else {
            break;
        }
    }
    band
}

fn line_stats(values: impl Iterator<Item = u8>) -> (f64, f64) {
    let (mut n, mut sum, mut sq) = (0.0, 0.0, 0.0);
    for v in values {
        let v = f64::from(v);
        n += 1.0;
        sum += v;
        sq += v * v;
    }
    if n == 0.0 {
        return (255.0, f64::MAX);
    }
    let mean = sum / n;
    (mean, (sq / n - mean * mean).max(0.0))
}

/// Wider bands on more edges are more likely to be a real scanner border.
fn confidence(trim: &Trim, w: u32, h: u32) -> f32 {
    let ratio = [
        trim.left as f32 / w as f32,
        trim.right as f32 / w as f32,
        trim.top as f32 / h as f32,
        trim.bottom as f32 / h as f32,
    ]
    .into_iter()
    .fold(0.0_f32, f32::max);

    let base: f32 = if ratio >= 0.015 {
        0.90
    } else if ratio >= 0.005 {
        0.75
    } else {
        0.50
    };
    let bonus = match trim.edges() {
        n if n >= 3 => 0.10,
        2 => 0.05,
        _ => 0.0,
    };
    (base + bonus).min(1.0)
}

/// Confident detections may take up to a fifth of each side; otherwise the
/// trim per axis is scaled down to 8% of that dimension.
fn clamp_trim(trim: Trim, w: u32, h: u32, confidence: f32) -> Trim {
    if confidence >= HIGH_CONFIDENCE {
        let max_x = (w as f32 * MAX_SIDE_TRIM) as u32;
        let max_y = (h as f32 * MAX_SIDE_TRIM) as u32;
        return Trim {
            left: trim.left.min(max_x),
            right: trim.right.min(max_x),
            top: trim.top.min(max_y),
            bottom: trim.bottom.min(max_y),
        };
    }

    let fit = |a: u32, b: u32, dim: u32| -> (u32, u32) {
        let budget = (dim as f32 * MAX_AXIS_TRIM) as u32;
        let total = a + b;
        if total <= budget {
            return (a, b);
        }
        let k = budget as f32 / total as f32;
        ((a as f32 * k) as u32, (b as f32 * k) as u32)
    };
    let (left, right) = fit(trim.left, trim.right, w);
    let (top, bottom) = fit(trim.top, trim.bottom, h);
    Trim {
        left,
        right,
        top,
        bottom,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    /// Light page with ink blocks, framed by black bands of the given widths.
    fn framed_page(w: u32, h: u32, trim: Trim) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            let in_border = x < trim.left || x >= w - trim.right || y < trim.top || y >= h - trim.bottom;
            if in_border {
                Luma([10])
            } else if (y % 40) < 10 && (x % 50) < 35 {
                Luma([40])
            } else {
                Luma([230])
            }
        })
    }

    #[test]
    fn test_clean_page_has_no_border() {
        assert_eq!(detect_border(&framed_page(600, 800, Trim::default())), None);
    }

    #[test]
    fn test_black_frame_is_cropped() {
        let trim = Trim {
            left: 30,
            right: 30,
            top: 30,
            bottom: 30,
        };
        let crop = detect_border(&framed_page(600, 800, trim)).unwrap();
        assert_eq!(crop.trim, trim);
        assert_eq!((crop.x, crop.y, crop.width, crop.height), (30, 30, 540, 740));
        assert!(crop.confidence >= HIGH_CONFIDENCE);
    }

    #[test]
    fn test_thin_band_is_ignored() {
        let trim = Trim {
            left: 6,
            ..Trim::default()
        };
        assert_eq!(detect_border(&framed_page(600, 800, trim)), None);
    }

    #[test]
    fn test_large_scan_is_measured_downscaled() {
        let trim = Trim {
            left: 60,
            top: 60,
            ..Trim::default()
        };
        let crop = detect_border(&framed_page(1600, 1200, trim)).unwrap();
        assert!((58..=62).contains(&crop.trim.left), "{:?}", crop.trim);
        assert!((58..=62).contains(&crop.trim.top), "{:?}", crop.trim);
        assert_eq!(crop.trim.right, 0);
    }

    #[test]
    fn test_trim_is_clamped_per_side() {
        let trim = Trim {
            left: 150,
            right: 150,
            top: 150,
            bottom: 150,
        };
        let crop = detect_border(&framed_page(600, 600, trim)).unwrap();
        assert_eq!(crop.trim.left, 108);
        assert_eq!(crop.width, 600 - 2 * 108);
    }

    #[test]
    fn test_low_confidence_trim_fits_axis_budget() {
        let trim = Trim {
            left: 40,
            right: 40,
            ..Trim::default()
        };
        let clamped = clamp_trim(trim, 500, 500, 0.75);
        assert_eq!((clamped.left, clamped.right), (20, 20));
    }
}
