//! Flat-field correction for uneven page illumination.
//!
//! The background is estimated with a wide Gaussian blur and divided out.
//! The result is kept only if it makes the page measurably more uniform
//! without blowing up contrast, which on clean scans mostly amplifies noise.

use image::{GrayImage, Luma};

use super::quality;

const TILE: u32 = 32;
/// Tile-mean spread below which a page counts as evenly lit.
const MIN_NONUNIFORMITY: f64 = 5.0;
const MIN_KERNEL: u32 = 31;
const KERNEL_RATIO: f32 = 0.04;
const MIN_STRETCH_RANGE: u8 = 10;
const MAX_CONTRAST_GAIN: f64 = 0.5;
const MIN_IMPROVEMENT: f64 = 0.15;
const MIN_CONFIDENCE: f64 = 0.70;

/// Illumination statistics of a page.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Uniformity {
    /// Standard deviation of the 32 px tile means.
    pub nonuniformity: f64,
    /// Standard deviation of all pixels.
    pub contrast: f64,
    /// Distance of the Otsu level from mid-grey.
    pub otsu_offset: f64,
}

#[derive(Debug, Clone)]
pub struct Normalized {
    pub image: GrayImage,
    pub confidence: f32,
    pub before: Uniformity,
    pub after: Uniformity,
}

pub fn measure(img: &GrayImage) -> Uniformity {
    let (w, h) = img.dimensions();
    let mut tile_means = Vec::new();
    for ty in (0..h).step_by(TILE as usize) {
        for tx in (0..w).step_by(TILE as usize) {
            let (mut sum, mut n) = (0.0, 0.0);
            for y in ty..(ty + TILE).min(h) {
                for x in tx..(tx + TILE).min(w) {
                    sum += f64::from(img.get_pixel(x, y)[0]);
                    n += 1.0;
                }
            }
            if n > 0.0 {
                tile_means.push(sum / n);
            }
        }
    }
    let pixels: Vec<f64> = img.pixels().map(|p| f64::from(p[0])).collect();
    let otsu = f64::from(imageproc::contrast::otsu_level(img));
    Uniformity {
        nonuniformity: std_dev(&tile_means),
        contrast: std_dev(&pixels),
        otsu_offset: (otsu - 128.0).abs(),
    }
}

fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}

/// Divides out the blurred background, then stretches the 1st..99th
/// percentile to the full range.
pub fn flatten(img: &GrayImage) -> GrayImage {
    let (w, h) = img.dimensions();
    let mut kernel = MIN_KERNEL.max((w.min(h) as f32 * KERNEL_RATIO).round() as u32);
    if kernel % 2 == 0 {
        kernel += 1;
    }
    let background = imageproc::filter::gaussian_blur_f32(img, kernel as f32 / 6.0);
    let bg_mean = background.pixels().map(|p| f64::from(p[0])).sum::<f64>() / f64::from((w * h).max(1));

    let mut out = GrayImage::from_fn(w, h, |x, y| {
        let bg = f64::from(background.get_pixel(x, y)[0]).max(1.0);
        let v = f64::from(img.get_pixel(x, y)[0]) / bg * bg_mean;
        Luma([v.round().clamp(0.0, 255.0) as u8])
    });

    let (lo, hi) = quality::percentiles(&out, 0.01, 0.99);
    if hi.saturating_sub(lo) > MIN_STRETCH_RANGE {
        let scale = 255.0 / f32::from(hi - lo);
        for p in out.pixels_mut() {
            let v = (f32::from(p[0].saturating_sub(lo)) * scale).round();
            p[0] = v.clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Flattens the page when its illumination is uneven and the correction
/// passes the quality gates. `None` leaves the page as it was.
pub fn normalize_background(img: &GrayImage) -> Option<Normalized> {
    let before = measure(img);
    if before.nonuniformity < MIN_NONUNIFORMITY {
        return None;
    }

    let image = flatten(img);
    let after = measure(&image);

    let improvement = 1.0 - after.nonuniformity / before.nonuniformity;
    let contrast_gain = if before.contrast > 0.0 {
        after.contrast / before.contrast - 1.0
    } else {
        0.0
    };
    if contrast_gain > MAX_CONTRAST_GAIN || improvement < MIN_IMPROVEMENT {
        tracing::debug!(improvement, contrast_gain, "Background correction rejected");
        return None;
    }

    let improvement_score = (improvement / 0.5).min(1.0);
    let contrast_score = (1.0 - contrast_gain.max(0.0) / MAX_CONTRAST_GAIN).clamp(0.0, 1.0);
    let otsu_stability = if before.otsu_offset > 0.0 {
        (after.otsu_offset / before.otsu_offset).min(1.0)
    } else {
        1.0
    };
    let confidence = 0.6 * improvement_score + 0.2 * contrast_score + 0.2 * otsu_stability;
    if confidence < MIN_CONFIDENCE {
        tracing::debug!(confidence, "Background correction below confidence");
        return None;
    }

    Some(Normalized {
        image,
        confidence: confidence as f32,
        before,
        after,
    })
}
