//! Builders for recognition results and page images.
//!
//! Coordinates are pixels of a 1000x1400 certificate or a 2000x1400 ledger
//! spread, matching what the scripted engine reports as page size.

#![allow(dead_code)]

use std::io::Cursor;

use image::{Rgb, RgbImage};

use metrica::{RawOcrResult, RawWord};

/// A blank white page. The width doubles as the scripted engine's key, so
/// every page of a test should use a distinct width.
pub fn page_png(width: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, 280, Rgb([255, 255, 255]));
    let mut png = Vec::new();
    img.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
        .expect("Failed to encode test page");
    png
}

/// Builder for a page of recognized words.
pub struct OcrPageBuilder {
    width: u32,
    height: u32,
    word_height: f32,
    char_width: f32,
    gap: f32,
    confidence: f32,
    words: Vec<RawWord>,
}

impl OcrPageBuilder {
    pub fn certificate() -> Self {
        Self {
            width: 1000,
            height: 1400,
            word_height: 20.0,
            char_width: 12.0,
            gap: 10.0,
            confidence: 0.95,
            words: Vec::new(),
        }
    }

    pub fn ledger() -> Self {
        Self {
            width: 2000,
            height: 1400,
            word_height: 16.0,
            char_width: 9.0,
            gap: 6.0,
            confidence: 0.92,
            words: Vec::new(),
        }
    }

    pub fn confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    /// Adds the words of `text` left to right starting at `(left, top)`.
    pub fn text(mut self, text: &str, left: f32, top: f32) -> Self {
        let mut x = left;
        for w in text.split_whitespace() {
            let width = self.char_width * w.chars().count() as f32;
            self.words.push(RawWord {
                text: w.to_string(),
                left: x,
                top,
                width,
                height: self.word_height,
                confidence: Some(self.confidence),
            });
            x += width + self.gap;
        }
        self
    }

    /// Adds one ledger row: each cell's text starts at its own x.
    pub fn row(mut self, top: f32, cells: &[(f32, &str)]) -> Self {
        for (left, text) in cells {
            self = self.text(text, *left, top);
        }
        self
    }

    pub fn build(self) -> RawOcrResult {
        RawOcrResult {
            engine: "scripted".to_string(),
            width: self.width,
            height: self.height,
            words: self.words,
        }
    }
}

/// A clean baptism certificate for Anna Petrova.
pub fn baptism_certificate(clergy: &str) -> RawOcrResult {
    OcrPageBuilder::certificate()
        .text("CERTIFICATE OF BAPTISM", 300.0, 60.0)
        .text("Name: Anna Petrova", 50.0, 200.0)
        .text("Date of Birth: 3 March 1911", 50.0, 260.0)
        .text("Date of Baptism: 12 March 1911", 50.0, 320.0)
        .text("Sponsors: Ivan Sidorov, Maria Sidorova", 50.0, 380.0)
        .text(&format!("Priest: {}", clergy), 50.0, 440.0)
        .text("Church: St. Nicholas Church", 50.0, 500.0)
        .build()
}

/// Caption row x positions of the built-in marriage register.
const LEDGER_COLUMNS: [f32; 5] = [60.0, 140.0, 300.0, 720.0, 1320.0];

/// A marriage register page with a caption row and one row per entry of
/// `(number, date, groom, bride, witnesses)`.
pub fn marriage_ledger(rows: &[(&str, &str, &str, &str, &str)]) -> RawOcrResult {
    let [no, date, groom, bride, witnesses] = LEDGER_COLUMNS;
    let mut page = OcrPageBuilder::ledger().row(
        400.0,
        &[(no, "No"), (date, "Date"), (groom, "Groom"), (bride, "Bride"), (witnesses, "Witnesses")],
    );
    for (i, (number, on, g, b, w)) in rows.iter().enumerate() {
        let top = 480.0 + 80.0 * i as f32;
        page = page.row(top, &[(no, number), (date, on), (groom, g), (bride, b), (witnesses, w)]);
    }
    page.build()
}

/// Words that match no record type.
pub fn unrelated_page() -> RawOcrResult {
    OcrPageBuilder::certificate()
        .text("Lorem ipsum dolor sit amet", 50.0, 200.0)
        .build()
}
