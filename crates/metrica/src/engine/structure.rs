//! Table-structure check for ledger pages and the recognition retry it
//! can trigger.
//!
//! A ledger page whose rows come back sparse, header-heavy or with broken
//! dates is recognized once more from an altered image: either without the
//! caption strip at the top or binarized. The caller keeps whichever
//! attempt scores higher.

use std::io::Cursor;

use image::{DynamicImage, GrayImage, ImageFormat};
use serde::Serialize;

use super::{RawOcrResult, RawWord};
use crate::error::PreprocessError;
use crate::record::{FieldFormat, RecordCandidate};
use crate::scoring::parse_date;
use crate::tokenizer::TokenizedPage;

/// Pages scoring below this get one retry.
pub const RETRY_THRESHOLD: f32 = 0.65;
/// Share of the page height cut off by [`RetryStrategy::DropHeaderStrip`].
const HEADER_STRIP: f32 = 0.12;

const GOOD_FILL: f32 = 0.30;
const POOR_FILL: f32 = 0.15;
const DENSE_ROW_CHARS: f32 = 10.0;
const SPARSE_ROW_CHARS: f32 = 3.0;
const HEADER_DOMINANCE: f32 = 0.5;

/// Measured shape of the rows extracted from one page.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StructureSignals {
    pub rows: usize,
    /// Filled cells over rows times columns in use.
    pub cell_fill: f32,
    pub chars_per_row: f32,
    /// Characters above the first row over all characters read.
    pub header_ratio: f32,
    /// Parseable share of date cells; `None` without date columns.
    pub date_rate: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StructureAssessment {
    pub score: f32,
    pub signals: StructureSignals,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    DropHeaderStrip,
    Binarized,
}

impl StructureAssessment {
    pub fn needs_retry(&self) -> bool {
        self.score < RETRY_THRESHOLD
    }

    /// The alteration most likely to help, or `None` when neither applies.
    pub fn retry_strategy(&self) -> Option<RetryStrategy> {
        let s = &self.signals;
        if s.header_ratio >= HEADER_DOMINANCE || (s.cell_fill < POOR_FILL && s.rows <= 1) {
            Some(RetryStrategy::DropHeaderStrip)
        } else if s.rows == 0 || s.chars_per_row < DENSE_ROW_CHARS {
            Some(RetryStrategy::Binarized)
        } else {
            None
        }
    }
}

pub fn assess(page: &TokenizedPage, rows: &[RecordCandidate]) -> StructureAssessment {
    let signals = measure(page, rows);
    let mut score = 0.0;
    if signals.rows >= 1 {
        score += 0.25;
    }
    if signals.cell_fill >= GOOD_FILL {
        score += 0.25;
    } else if signals.cell_fill >= POOR_FILL {
        score += 0.12;
    }
    if signals.chars_per_row >= DENSE_ROW_CHARS {
        score += 0.20;
    } else if signals.chars_per_row >= SPARSE_ROW_CHARS {
        score += 0.10;
    }
    if signals.header_ratio < HEADER_DOMINANCE {
        score += 0.15;
    }
    score += 0.15 * signals.date_rate.unwrap_or(1.0);
    StructureAssessment {
        score: score.min(1.0),
        signals,
    }
}

fn measure(page: &TokenizedPage, rows: &[RecordCandidate]) -> StructureSignals {
    let filled = |row: &RecordCandidate| {
        row.fields
            .iter()
            .filter(|(_, f)| !f.value.trim().is_empty())
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>()
    };
    let mut columns: Vec<String> = rows.iter().flat_map(filled).collect();
    columns.sort();
    columns.dedup();
    let cells: usize = rows.iter().map(|r| filled(r).len()).sum();
    let cell_fill = if rows.is_empty() || columns.is_empty() {
        0.0
    } else {
        cells as f32 / (rows.len() * columns.len()) as f32
    };

    let data_chars: usize = rows
        .iter()
        .flat_map(|r| r.fields.values())
        .map(|f| f.value.trim().chars().count())
        .sum();
    let chars_per_row = if rows.is_empty() {
        0.0
    } else {
        data_chars as f32 / rows.len() as f32
    };

    let row_tokens: Vec<u32> = rows
        .iter()
        .flat_map(|r| r.fields.values())
        .flat_map(|f| f.token_ids.iter().copied())
        .collect();
    let first_row_top = page
        .tokens
        .iter()
        .filter(|t| row_tokens.contains(&t.id))
        .map(|t| t.bbox.y)
        .fold(f32::INFINITY, f32::min);
    let header_chars: usize = page
        .tokens
        .iter()
        .filter(|t| t.bbox.bottom() <= first_row_top)
        .map(|t| t.text.chars().count())
        .sum();
    let total = header_chars + data_chars;
    let header_ratio = if total == 0 {
        1.0
    } else {
        header_chars as f32 / total as f32
    };

    let dates: Vec<bool> = rows
        .iter()
        .flat_map(|r| r.fields.iter())
        .filter(|(name, f)| FieldFormat::for_field(name) == FieldFormat::Date && !f.value.trim().is_empty())
        .map(|(_, f)| parse_date(f.value.trim()).is_some())
        .collect();
    let date_rate = (!dates.is_empty()).then(|| dates.iter().filter(|ok| **ok).count() as f32 / dates.len() as f32);

    StructureSignals {
        rows: rows.len(),
        cell_fill,
        chars_per_row,
        header_ratio,
        date_rate,
    }
}

/// An altered page image plus what is needed to map its words back onto
/// the original page.
#[derive(Debug, Clone)]
pub struct ImageVariant {
    pub png: Vec<u8>,
    height: u32,
    y_offset: u32,
    full_height: u32,
}

impl RetryStrategy {
    pub fn variant(&self, png: &[u8]) -> Result<ImageVariant, PreprocessError> {
        let img = image::load_from_memory(png).map_err(|e| PreprocessError::Decode(e.to_string()))?;
        let (w, h) = (img.width(), img.height());
        match self {
            RetryStrategy::DropHeaderStrip => {
                let strip = (h as f32 * HEADER_STRIP).round() as u32;
                let cropped = img.crop_imm(0, strip, w, h.saturating_sub(strip).max(1));
                Ok(ImageVariant {
                    png: encode(&cropped)?,
                    height: cropped.height(),
                    y_offset: strip,
                    full_height: h,
                })
            }
            RetryStrategy::Binarized => {
                let gray = img.to_luma8();
                Ok(ImageVariant {
                    png: encode(&DynamicImage::ImageLuma8(binarize(&gray)))?,
                    height: h,
                    y_offset: 0,
                    full_height: h,
                })
            }
        }
    }
}

impl ImageVariant {
    /// Moves words recognized on the variant back to page coordinates, in
    /// whatever pixel scale the engine reported.
    pub fn restore(&self, raw: &RawOcrResult) -> RawOcrResult {
        let scale = raw.height as f32 / self.height.max(1) as f32;
        let offset = self.y_offset as f32 * scale;
        RawOcrResult {
            engine: raw.engine.clone(),
            width: raw.width,
            height: (self.full_height as f32 * scale).round() as u32,
            words: raw
                .words
                .iter()
                .map(|w| RawWord {
                    top: w.top + offset,
                    ..w.clone()
                })
                .collect(),
        }
    }
}

/// Otsu threshold to pure black and white.
fn binarize(gray: &GrayImage) -> GrayImage {
    let level = imageproc::contrast::otsu_level(gray);
    let mut out = gray.clone();
    for p in out.pixels_mut() {
        p.0[0] = if p.0[0] > level { 255 } else { 0 };
    }
    out
}

fn encode(img: &DynamicImage) -> Result<Vec<u8>, PreprocessError> {
    let mut out = Vec::new();
    img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .map_err(|e| PreprocessError::Encode(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BBox;
    use crate::record::{fields, ExtractionMethod, FieldValue, RecordType};
    use crate::tokenizer::{Script, Token};
    use image::Luma;

    fn token(id: u32, text: &str, y: f32) -> Token {
        Token {
            id,
            text: text.to_string(),
            bbox: BBox::new(100.0, y, 80.0, 16.0),
            script: Script::Latin,
            line: id,
            confidence: 0.9,
        }
    }

    fn page(tokens: Vec<Token>) -> TokenizedPage {
        TokenizedPage {
            width: 2000,
            height: 1400,
            tokens,
            rule_lines: Vec::new(),
            detected_language: None,
        }
    }

    fn row(cells: &[(&str, &str, u32)]) -> RecordCandidate {
        let mut c = RecordCandidate::new(RecordType::Marriage);
        for (name, value, token) in cells {
            c.fields.insert(
                name.to_string(),
                FieldValue::extracted(value.to_string(), ExtractionMethod::Column, vec![*token], 0.9, 1.0),
            );
        }
        c
    }

    #[test]
    fn test_clean_ledger_scores_full() {
        let page = page(vec![token(0, "Groom", 400.0), token(1, "Ivan", 480.0), token(2, "x", 480.0)]);
        let rows = [row(&[
            (fields::GROOM_NAME, "Ivan Petrov", 1),
            (fields::MARRIAGE_DATE, "12.05.1912", 2),
        ])];
        let assessment = assess(&page, &rows);
        assert!((assessment.score - 1.0).abs() < 1e-6, "{:?}", assessment);
        assert!(!assessment.needs_retry());
        assert_eq!(assessment.signals.date_rate, Some(1.0));
    }

    #[test]
    fn test_header_heavy_page_drops_the_strip() {
        let page = page(vec![
            token(0, "Register of marriages solemnized in the parish", 100.0),
            token(1, "Groom Bride Witnesses", 400.0),
            token(2, "Ivan", 480.0),
        ]);
        let rows = [row(&[(fields::GROOM_NAME, "Ivan", 2), (fields::MARRIAGE_DATE, "1?.0", 2)])];
        let assessment = assess(&page, &rows);
        assert!(assessment.signals.header_ratio > 0.5);
        assert!(assessment.needs_retry(), "{:?}", assessment);
        assert_eq!(assessment.retry_strategy(), Some(RetryStrategy::DropHeaderStrip));
    }

    #[test]
    fn test_sparse_rows_retry_binarized() {
        let page = page(vec![
            token(0, "No", 400.0),
            token(1, "1", 480.0),
            token(2, "x?", 560.0),
            token(3, "Iv", 640.0),
            token(4, "An", 720.0),
        ]);
        // One scrap per row, each in a different column.
        let rows = [
            row(&[(fields::RECORD_NUMBER, "1", 1)]),
            row(&[(fields::MARRIAGE_DATE, "x?", 2)]),
            row(&[(fields::GROOM_NAME, "Iv", 3)]),
            row(&[(fields::BRIDE_NAME, "An", 4)]),
        ];
        let assessment = assess(&page, &rows);
        assert_eq!(assessment.signals.cell_fill, 0.25);
        assert_eq!(assessment.signals.date_rate, Some(0.0));
        assert!(assessment.needs_retry(), "{:?}", assessment);
        assert_eq!(assessment.retry_strategy(), Some(RetryStrategy::Binarized));
    }

    #[test]
    fn test_no_rows_scores_low() {
        let assessment = assess(&page(vec![token(0, "Witnesses", 400.0)]), &[]);
        assert_eq!(assessment.signals.rows, 0);
        assert!(assessment.score < RETRY_THRESHOLD);
        assert_eq!(assessment.retry_strategy(), Some(RetryStrategy::DropHeaderStrip));
    }

    fn png(img: &GrayImage) -> Vec<u8> {
        encode(&DynamicImage::ImageLuma8(img.clone())).unwrap()
    }

    #[test]
    fn test_header_strip_variant_maps_words_back() {
        let variant = RetryStrategy::DropHeaderStrip
            .variant(&png(&GrayImage::from_pixel(200, 100, Luma([200]))))
            .unwrap();
        let decoded = image::load_from_memory(&variant.png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (200, 88));

        let raw = RawOcrResult {
            engine: "e".into(),
            width: 200,
            height: 88,
            words: vec![RawWord {
                text: "Ivan".into(),
                left: 10.0,
                top: 5.0,
                width: 30.0,
                height: 8.0,
                confidence: Some(0.9),
            }],
        };
        let restored = variant.restore(&raw);
        assert_eq!(restored.height, 100);
        assert_eq!(restored.words[0].top, 17.0);
        assert_eq!(restored.words[0].left, 10.0);

        // Engines reporting a larger pixel grid get the offset scaled to it.
        let doubled = RawOcrResult {
            width: 400,
            height: 176,
            ..raw
        };
        let restored = variant.restore(&doubled);
        assert_eq!(restored.height, 200);
        assert_eq!(restored.words[0].top, 29.0);
    }

    #[test]
    fn test_binarized_variant_is_two_tone() {
        let img = GrayImage::from_fn(60, 40, |x, _| Luma([if x < 20 { 40 } else { 210 }]));
        let variant = RetryStrategy::Binarized.variant(&png(&img)).unwrap();
        let decoded = image::load_from_memory(&variant.png).unwrap().to_luma8();
        assert!(decoded.pixels().all(|p| p.0[0] == 0 || p.0[0] == 255));
        assert_eq!(decoded.get_pixel(5, 5).0[0], 0);
        assert_eq!(decoded.get_pixel(50, 5).0[0], 255);
    }
}
