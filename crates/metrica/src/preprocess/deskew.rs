use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};

/// Angles below this are left alone; resampling costs more than it fixes.
pub const MIN_CORRECTION_DEGREES: f32 = 0.35;

const ANALYSIS_WIDTH: u32 = 800;
const MAX_SAMPLES: usize = 200_000;

/// Estimates page skew in degrees by projection-profile search.
///
/// A positive angle means text lines descend to the right. The search is
/// coarse (0.5°) over `±max_degrees`, then fine (0.1°) around the best
/// coarse angle.
pub fn estimate_skew(img: &GrayImage, max_degrees: f32) -> f32 {
    let small;
    let img = if img.width() > ANALYSIS_WIDTH {
        let scale = ANALYSIS_WIDTH as f32 / img.width() as f32;
        let height = ((img.height() as f32 * scale).round() as u32).max(1);
        small = imageops::resize(img, ANALYSIS_WIDTH, height, FilterType::Triangle);
        &small
    } else {
        img
    };

    let threshold = imageproc::contrast::otsu_level(img);
    let mut dark: Vec<(f32, f32)> = img
        .enumerate_pixels()
        .filter(|(_, _, p)| p.0[0] < threshold)
        .map(|(x, y, _)| (x as f32, y as f32))
        .collect();
    if dark.len() < 50 {
        return 0.0;
    }
    if dark.len() > MAX_SAMPLES {
        let step = dark.len() / MAX_SAMPLES + 1;
        dark = dark.into_iter().step_by(step).collect();
    }

    let mut best = (0.0_f32, profile_score(&dark, img.height(), 0.0));
    let search = |from: f32, to: f32, step: f32, best: &mut (f32, f64)| {
        let steps = ((to - from) / step).round() as i32;
        for i in 0..=steps {
            let angle = from + i as f32 * step;
            let score = profile_score(&dark, img.height(), angle);
            // Strictly greater keeps the angle nearest zero on ties.
            if score > best.1 {
                *best = (angle, score);
            }
        }
    };
    search(-max_degrees, max_degrees, 0.5, &mut best);
    let coarse = best.0;
    search(
        (coarse - 0.5).max(-max_degrees),
        (coarse + 0.5).min(max_degrees),
        0.1,
        &mut best,
    );
    (best.0 * 10.0).round() / 10.0
}

/// Sum of squared differences between adjacent row counts after shearing
/// dark pixels by `angle`. Aligned text lines give sharp peaks.
fn profile_score(dark: &[(f32, f32)], height: u32, angle_degrees: f32) -> f64 {
    let tan = angle_degrees.to_radians().tan();
    let rows: Vec<i64> = dark
        .iter()
        .map(|(x, y)| (y - x * tan).round() as i64)
        .collect();
    let (Some(min), Some(max)) = (rows.iter().min(), rows.iter().max()) else {
        return 0.0;
    };
    let span = (max - min + 1).max(i64::from(height)) as usize;
    let mut histogram = vec![0i64; span];
    for r in &rows {
        histogram[(r - min) as usize] += 1;
    }
    histogram
        .windows(2)
        .map(|w| {
            let d = (w[1] - w[0]) as f64;
            d * d
        })
        .sum()
}

/// Rotates the page to undo a skew of `angle_degrees`, filling with white.
pub fn deskew(img: &GrayImage, angle_degrees: f32) -> GrayImage {
    rotate_about_center(
        img,
        -angle_degrees.to_radians(),
        Interpolation::Bilinear,
        Luma([255]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ruled_page() -> GrayImage {
        let mut img = GrayImage::from_pixel(400, 300, Luma([255]));
        for k in 0..8 {
            let top = 40 + k * 30;
            for y in top..top + 4 {
                for x in 40..360 {
                    img.put_pixel(x, y, Luma([0]));
                }
            }
        }
        img
    }

    #[test]
    fn test_straight_page_has_no_skew() {
        assert!(estimate_skew(&ruled_page(), 15.0).abs() < 0.15);
    }

    #[test]
    fn test_detects_and_corrects_skew() {
        let skewed = rotate_about_center(
            &ruled_page(),
            3.0_f32.to_radians(),
            Interpolation::Bilinear,
            Luma([255]),
        );
        let angle = estimate_skew(&skewed, 15.0);
        assert!((angle - 3.0).abs() < 0.35, "estimated {}", angle);

        let fixed = deskew(&skewed, angle);
        assert!(estimate_skew(&fixed, 15.0).abs() < 0.35);
    }

    #[test]
    fn test_blank_page() {
        let blank = GrayImage::from_pixel(100, 100, Luma([255]));
        assert_eq!(estimate_skew(&blank, 15.0), 0.0);
    }
}
