//! Two-page spreads: a landscape scan of an open register with a bright
//! gutter near the middle is cut into its left and right pages.

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage};

const MIN_ASPECT: f32 = 1.2;
const ANALYSIS_WIDTH: u32 = 800;
const SMOOTH_RADIUS: usize = 5;
const SEARCH_FROM: f32 = 0.40;
const SEARCH_TO: f32 = 0.60;
const MIN_VALLEY_DEPTH: f64 = 30.0;
const MIN_CONFIDENCE: f32 = 0.70;
/// Below this confidence both halves must keep 40% of the width.
const BALANCED_CONFIDENCE: f32 = 0.90;
const MIN_SIDE_RATIO: f32 = 0.40;
const MIN_PAGE_PX: u32 = 512;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpreadSplit {
    /// Gutter column in full-resolution pixels.
    pub split_x: u32,
    pub confidence: f32,
}

/// Locates the gutter of a two-page spread.
pub fn detect_spread(gray: &GrayImage) -> Option<SpreadSplit> {
    let (w, h) = gray.dimensions();
    if h == 0 || (w as f32) < MIN_ASPECT * h as f32 {
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

    let profile = smooth(&column_means(&small), SMOOTH_RADIUS);
    let n = profile.len();
    let from = (n as f32 * SEARCH_FROM) as usize;
    let to = ((n as f32 * SEARCH_TO) as usize).min(n);
    if from >= to {
        return None;
    }

    let (best, best_value) = profile[from..to]
        .iter()
        .enumerate()
        .fold((from, f64::MIN), |acc, (i, &v)| if v > acc.1 { (from + i, v) } else { acc });
    let outside: Vec<f64> = profile[..from].iter().chain(&profile[to..]).copied().collect();
    if outside.is_empty() {
        return None;
    }
    let page_mean = outside.iter().sum::<f64>() / outside.len() as f64;
    let depth = best_value - page_mean;
    if depth < MIN_VALLEY_DEPTH {
        return None;
    }

    let depth_score = (0.5 + (depth - MIN_VALLEY_DEPTH) * 0.5 / 60.0).min(1.0) as f32;
    let center = best as f32 / n as f32;
    let center_score = (1.0 - (center - 0.5).abs() * 5.0).max(0.3);
    let confidence = 0.6 * depth_score + 0.4 * center_score;
    if confidence < MIN_CONFIDENCE {
        tracing::debug!(confidence, "Spread gutter below confidence");
        return None;
    }

    let split_x = ((best as f32 + 0.5) * scale).round() as u32;
    if confidence < BALANCED_CONFIDENCE {
        let min_side = (w as f32 * MIN_SIDE_RATIO) as u32;
        if split_x < min_side || w - split_x < min_side {
            return None;
        }
    }
    if split_x.min(w - split_x) < MIN_PAGE_PX || h < MIN_PAGE_PX {
        return None;
    }
    Some(SpreadSplit { split_x, confidence })
}

/// Cuts a detected spread into its left and right pages.
pub fn split_spread(img: &DynamicImage) -> Option<(DynamicImage, DynamicImage, SpreadSplit)> {
    let split = detect_spread(&img.to_luma8())?;
    let (w, h) = (img.width(), img.height());
    let left = img.crop_imm(0, 0, split.split_x, h);
    let right = img.crop_imm(split.split_x, 0, w - split.split_x, h);
    Some((left, right, split))
}

fn column_means(img: &GrayImage) -> Vec<f64> {
    let (w, h) = img.dimensions();
    (0..w)
        .map(|x| (0..h).map(|y| f64::from(img.get_pixel(x, y)[0])).sum::<f64>() / f64::from(h))
        .collect()
}

fn smooth(values: &[f64], radius: usize) -> Vec<f64> {
    (0..values.len())
        .map(|i| {
            let lo = i.saturating_sub(radius);
            let hi = (i + radius + 1).min(values.len());
            values[lo..hi].iter().sum::<f64>() / (hi - lo) as f64
        })
        .collect()
}
