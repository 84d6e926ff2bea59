use std::io::Cursor;
use std::sync::Arc;

use super::{OcrEngine, RawOcrResult, RawWord};
use crate::error::{EngineError, PermanentKind, TransientKind};

/// Local recognition through the Tesseract C API.
#[derive(Clone)]
pub struct TesseractEngine {
    inner: Arc<TesseractInner>,
}

struct TesseractInner {
    languages: String,
}

impl TesseractEngine {
    pub fn new(languages: &[String]) -> Self {
        let languages = if languages.is_empty() {
            "eng".to_string()
        } else {
            languages.join("+")
        };
        Self {
            inner: Arc::new(TesseractInner { languages }),
        }
    }

    pub fn languages(&self) -> &str {
        &self.inner.languages
    }
}

impl OcrEngine for TesseractEngine {
    fn name(&self) -> &str {
        "tesseract"
    }

    fn recognize(&self, image: &[u8]) -> Result<RawOcrResult, EngineError> {
        let _span = tracing::info_span!("engine.tesseract").entered();

        let img = image::load_from_memory(image).map_err(|e| {
            EngineError::permanent(PermanentKind::BadImage, format!("Failed to load image: {}", e))
        })?;
        let (width, height) = (img.width(), img.height());

        // leptonica reads PNG reliably regardless of the upload format.
        let mut png = Vec::new();
        img.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .map_err(|e| {
                EngineError::permanent(PermanentKind::BadImage, format!("Failed to convert image: {}", e))
            })?;

        // Initialization failures mean missing language data on this host;
        // another worker may be configured correctly.
        let mut lt = leptess::LepTess::new(None, &self.inner.languages).map_err(|e| {
            EngineError::transient(
                TransientKind::Network,
                format!("Failed to initialize Tesseract: {}", e),
            )
        })?;
        lt.set_image_from_mem(&png).map_err(|e| {
            EngineError::permanent(PermanentKind::BadImage, format!("Failed to set image: {}", e))
        })?;
        let tsv = lt.get_tsv_text(0).map_err(|e| {
            EngineError::permanent(PermanentKind::BadImage, format!("Recognition failed: {}", e))
        })?;

        Ok(RawOcrResult {
            engine: self.name().to_string(),
            width,
            height,
            words: parse_tsv(&tsv),
        })
    }
}

/// Parses Tesseract TSV output, keeping word-level rows (level 5) with text.
///
/// Columns: level, page, block, par, line, word, left, top, width, height,
/// conf, text. Confidence is reported 0..100, or -1 when unavailable.
pub fn parse_tsv(tsv: &str) -> Vec<RawWord> {
    tsv.lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.splitn(12, '\t').collect();
            if cols.len() < 12 || cols[0] != "5" {
                return None;
            }
            let text = cols[11].trim();
            if text.is_empty() {
                return None;
            }
            let num = |i: usize| cols[i].trim().parse::<f32>().ok();
            let confidence = num(10).filter(|c| *c >= 0.0).map(|c| (c / 100.0).min(1.0));
            Some(RawWord {
                text: text.to_string(),
                left: num(6)?,
                top: num(7)?,
                width: num(8)?,
                height: num(9)?,
                confidence,
            })
        })
        .collect()
}
