//! Image normalization ahead of recognition.
//!
//! Stages run in a fixed order and each can be switched off in
//! [`PreprocessConfig`]: orientation, resize, border crop, grayscale,
//! contrast, denoise, deskew, background flattening. The quality score is
//! measured on the scan before enhancement. Spread splitting happens earlier,
//! at ingest, because it changes the page count.

use std::io::Cursor;

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageDecoder, RgbImage};

use crate::config::PreprocessConfig;
use crate::error::PreprocessError;

pub mod background;
pub mod border;
pub mod deskew;
pub mod quality;
pub mod spread;

/// Estimated noise sigma above which the median filter is applied.
const NOISE_THRESHOLD: f64 = 8.0;

/// Output of [`Preprocessor::prepare`].
#[derive(Debug, Clone)]
pub struct PreparedImage {
    /// PNG encoding of the normalized page.
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub quality: f32,
    pub low_quality: bool,
    pub deskew_angle: f32,
    pub denoised: bool,
    /// Dark scanner border removed before enhancement.
    pub border: Option<border::BorderCrop>,
    pub background_normalized: bool,
    /// Normalized y centers of horizontal ruling.
    pub rule_lines: Vec<f32>,
}

enum Working {
    Gray(GrayImage),
    Rgb(RgbImage),
}

impl Working {
    fn luma(&self) -> GrayImage {
        match self {
            Working::Gray(g) => g.clone(),
            Working::Rgb(rgb) => imageops::grayscale(rgb),
        }
    }

    fn dimensions(&self) -> (u32, u32) {
        match self {
            Working::Gray(g) => g.dimensions(),
            Working::Rgb(rgb) => rgb.dimensions(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Preprocessor {
    config: PreprocessConfig,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    /// Normalizes raw upload bytes. The input is never modified.
    pub fn prepare(&self, raw: &[u8]) -> Result<PreparedImage, PreprocessError> {
        let _span = tracing::info_span!("preprocess", bytes = raw.len()).entered();
        let cfg = &self.config;

        let mut img = decode_oriented(raw, cfg.orientation)?;
        img = match cfg.rotation_degrees {
            90 => img.rotate90(),
            180 => img.rotate180(),
            270 => img.rotate270(),
            _ => img,
        };
        if img.width() == 0 || img.height() == 0 {
            return Err(PreprocessError::EmptyImage);
        }
        let source_short_side = img.width().min(img.height());

        if img.width().max(img.height()) > cfg.max_dimension {
            img = img.resize(cfg.max_dimension, cfg.max_dimension, FilterType::Lanczos3);
            tracing::debug!(width = img.width(), height = img.height(), "Resized page");
        }

        let border = if cfg.border_crop {
            border::detect_border(&img.to_luma8())
        } else {
            None
        };
        if let Some(crop) = &border {
            img = img.crop_imm(crop.x, crop.y, crop.width, crop.height);
            tracing::debug!(trim = ?crop.trim, confidence = crop.confidence, "Cropped scanner border");
        }

        let mut working = if cfg.grayscale {
            Working::Gray(img.to_luma8())
        } else {
            Working::Rgb(img.to_rgb8())
        };

        let scan = working.luma();
        let quality = quality::quality_score(&scan, source_short_side);

        if cfg.contrast {
            let (lo, hi) = quality::percentiles(&scan, 0.02, 0.98);
            match &mut working {
                Working::Gray(g) => quality::stretch_contrast(g),
                Working::Rgb(rgb) => stretch_channels(rgb, lo, hi),
            }
        }

        let mut denoised = false;
        if cfg.denoise {
            let noise = quality::estimate_noise(&working.luma());
            if noise > NOISE_THRESHOLD {
                working = match working {
                    Working::Gray(g) => Working::Gray(imageproc::filter::median_filter(&g, 1, 1)),
                    Working::Rgb(rgb) => Working::Rgb(imageproc::filter::median_filter(&rgb, 1, 1)),
                };
                denoised = true;
                tracing::debug!(noise, "Applied median filter");
            }
        }

        let mut deskew_angle = 0.0;
        if cfg.deskew {
            let angle = deskew::estimate_skew(&working.luma(), cfg.max_deskew_degrees);
            if angle.abs() >= deskew::MIN_CORRECTION_DEGREES {
                working = match working {
                    Working::Gray(g) => Working::Gray(deskew::deskew(&g, angle)),
                    Working::Rgb(rgb) => Working::Rgb(rotate_rgb(&rgb, angle)),
                };
                deskew_angle = angle;
                tracing::debug!(angle, "Deskewed page");
            }
        }

        let mut background_normalized = false;
        if cfg.background {
            if let Working::Gray(g) = &working {
                if let Some(normalized) = background::normalize_background(g) {
                    tracing::debug!(
                        confidence = normalized.confidence,
                        before = normalized.before.nonuniformity,
                        after = normalized.after.nonuniformity,
                        "Flattened uneven background"
                    );
                    working = Working::Gray(normalized.image);
                    background_normalized = true;
                }
            }
        }

        let final_luma = working.luma();
        let threshold = imageproc::contrast::otsu_level(&final_luma);
        let rule_lines = quality::detect_rule_lines(&final_luma, threshold);

        let (width, height) = working.dimensions();
        let dynamic = match working {
            Working::Gray(g) => DynamicImage::ImageLuma8(g),
            Working::Rgb(rgb) => DynamicImage::ImageRgb8(rgb),
        };
        let mut png = Vec::new();
        dynamic
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .map_err(|e| PreprocessError::Encode(e.to_string()))?;

        let low_quality = quality < cfg.low_quality_threshold;
        tracing::info!(
            quality,
            low_quality,
            deskew_angle,
            rule_lines = rule_lines.len(),
            "Page prepared"
        );

        Ok(PreparedImage {
            png,
            width,
            height,
            quality,
            low_quality,
            deskew_angle,
            denoised,
            border,
            background_normalized,
            rule_lines,
        })
    }
}

/// Decodes an image, applying its EXIF orientation when asked.
fn decode_oriented(raw: &[u8], apply_orientation: bool) -> Result<DynamicImage, PreprocessError> {
    let decode_err = |e: image::ImageError| PreprocessError::Decode(e.to_string());
    let reader = image::ImageReader::new(Cursor::new(raw))
        .with_guessed_format()
        .map_err(|e| PreprocessError::Decode(e.to_string()))?;
    let mut decoder = reader.into_decoder().map_err(decode_err)?;
    let orientation = decoder.orientation().ok();
    let mut img = DynamicImage::from_decoder(decoder).map_err(decode_err)?;
    if let (true, Some(orientation)) = (apply_orientation, orientation) {
        img.apply_orientation(orientation);
    }
    Ok(img)
}

fn stretch_channels(rgb: &mut RgbImage, lo: u8, hi: u8) {
    if hi <= lo {
        return;
    }
    let scale = 255.0 / f32::from(hi - lo);
    for p in rgb.pixels_mut() {
        for c in p.0.iter_mut() {
            *c = (f32::from(c.saturating_sub(lo)) * scale).round().clamp(0.0, 255.0) as u8;
        }
    }
}

fn rotate_rgb(rgb: &RgbImage, angle_degrees: f32) -> RgbImage {
    imageproc::geometric_transformations::rotate_about_center(
        rgb,
        -angle_degrees.to_radians(),
        imageproc::geometric_transformations::Interpolation::Bilinear,
        image::Rgb([255, 255, 255]),
    )
}
