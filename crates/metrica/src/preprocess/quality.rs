//! Image statistics used for the quality score, denoise decision and
//! ruled-ledger detection.

use image::GrayImage;

/// Grey levels at the given lower and upper percentiles.
pub fn percentiles(img: &GrayImage, low: f32, high: f32) -> (u8, u8) {
    let mut histogram = [0u64; 256];
    for p in img.pixels() {
        histogram[p.0[0] as usize] += 1;
    }
    let total = img.pixels().len() as f64;
    if total == 0.0 {
        return (0, 255);
    }

    let find = |fraction: f32| -> u8 {
        let target = total * f64::from(fraction);
        let mut seen = 0.0;
        for (level, count) in histogram.iter().enumerate() {
            seen += *count as f64;
            if seen >= target {
                return level as u8;
            }
        }
        255
    };
    (find(low), find(high))
}

/// Linear stretch mapping the 2nd..98th percentile to the full range.
pub fn stretch_contrast(img: &mut GrayImage) {
    let (lo, hi) = percentiles(img, 0.02, 0.98);
    if hi <= lo {
        return;
    }
    let scale = 255.0 / f32::from(hi - lo);
    for p in img.pixels_mut() {
        let v = (f32::from(p.0[0].saturating_sub(lo)) * scale).round();
        p.0[0] = v.clamp(0.0, 255.0) as u8;
    }
}

/// Variance of the 4-neighbour Laplacian. Higher means sharper edges.
pub fn laplacian_variance(img: &GrayImage) -> f64 {
    let (w, h) = img.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }
    let px = |x: u32, y: u32| f64::from(img.get_pixel(x, y).0[0]);
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut n = 0.0;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let lap = px(x - 1, y) + px(x + 1, y) + px(x, y - 1) + px(x, y + 1) - 4.0 * px(x, y);
            sum += lap;
            sum_sq += lap * lap;
            n += 1.0;
        }
    }
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0)
}

/// Fast noise standard deviation estimate (Immerkaer 1996).
pub fn estimate_noise(img: &GrayImage) -> f64 {
    let (w, h) = img.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }
    let px = |x: u32, y: u32| f64::from(img.get_pixel(x, y).0[0]);
    let mut sum = 0.0;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let v = px(x - 1, y - 1) - 2.0 * px(x, y - 1) + px(x + 1, y - 1)
                - 2.0 * px(x - 1, y)
                + 4.0 * px(x, y)
                - 2.0 * px(x + 1, y)
                + px(x - 1, y + 1)
                - 2.0 * px(x, y + 1)
                + px(x + 1, y + 1);
            sum += v.abs();
        }
    }
    let n = f64::from(w - 2) * f64::from(h - 2);
    (std::f64::consts::PI / 2.0).sqrt() * sum / (6.0 * n)
}

/// Combined quality in `[0, 1]`.
///
/// `sharpness` saturates at a Laplacian variance of 400, `contrast` is the
/// 2..98 percentile spread, `resolution` saturates at a 1200 px short side.
pub fn quality_score(img: &GrayImage, source_short_side: u32) -> f32 {
    let sharpness = (laplacian_variance(img) / 400.0).min(1.0) as f32;
    let (lo, hi) = percentiles(img, 0.02, 0.98);
    let contrast = f32::from(hi.saturating_sub(lo)) / 255.0;
    let resolution = (source_short_side as f32 / 1200.0).min(1.0);
    (0.45 * sharpness + 0.35 * contrast + 0.20 * resolution).clamp(0.0, 1.0)
}

/// Pixel rows whose longest dark run spans at least 60% of the width,
/// merged into bands and reported as normalized y centers.
pub fn detect_rule_lines(img: &GrayImage, dark_threshold: u8) -> Vec<f32> {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return Vec::new();
    }
    let min_run = (w as f32 * 0.6).ceil() as u32;

    let mut lines = Vec::new();
    let mut band_start: Option<u32> = None;
    for y in 0..h {
        let mut longest = 0;
        let mut run = 0;
        for x in 0..w {
            if img.get_pixel(x, y).0[0] < dark_threshold {
                run += 1;
                longest = longest.max(run);
            } else {
                run = 0;
            }
        }
        let is_rule = longest >= min_run;
        match (is_rule, band_start) {
            (true, None) => band_start = Some(y),
            (false, Some(start)) => {
                lines.push((start + y - 1) as f32 / 2.0 / h as f32);
                band_start = None;
            }
            _ => {}
        }
    }
    if let Some(start) = band_start {
        lines.push((start + h - 1) as f32 / 2.0 / h as f32);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn checkerboard(size: u32, cell: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            if ((x / cell) + (y / cell)) % 2 == 0 {
                Luma([20])
            } else {
                Luma([235])
            }
        })
    }

    #[test]
    fn test_percentiles_and_stretch() {
        let mut img = GrayImage::from_fn(100, 1, |x, _| Luma([100 + (x as u8 / 2)]));
        let (lo, hi) = percentiles(&img, 0.02, 0.98);
        assert!(lo <= 101 && hi >= 148);
        stretch_contrast(&mut img);
        assert_eq!(img.get_pixel(0, 0).0[0], 0);
        assert_eq!(img.get_pixel(99, 0).0[0], 255);
    }

    #[test]
    fn test_flat_image_scores_low() {
        let flat = GrayImage::from_pixel(400, 400, Luma([200]));
        let sharp = checkerboard(400, 4);
        assert_eq!(laplacian_variance(&flat), 0.0);
        assert!(quality_score(&flat, 400) < 0.1);
        assert!(quality_score(&sharp, 1600) > 0.8);
    }

    #[test]
    fn test_noise_estimate_separates_clean_and_noisy() {
        let clean = GrayImage::from_pixel(64, 64, Luma([128]));
        let noisy = GrayImage::from_fn(64, 64, |x, y| {
            Luma([if (x * 7 + y * 13) % 5 == 0 { 200 } else { 100 }])
        });
        assert!(estimate_noise(&clean) < 0.01);
        assert!(estimate_noise(&noisy) > 10.0);
    }

    #[test]
    fn test_rule_lines() {
        let mut img = GrayImage::from_pixel(200, 100, Luma([255]));
        for x in 10..190 {
            img.put_pixel(x, 30, Luma([0]));
            img.put_pixel(x, 31, Luma([0]));
        }
        // Too short to be a rule.
        for x in 0..50 {
            img.put_pixel(x, 70, Luma([0]));
        }
        let lines = detect_rule_lines(&img, 128);
        assert_eq!(lines.len(), 1);
        assert!((lines[0] - 0.305).abs() < 0.01);
    }
}
