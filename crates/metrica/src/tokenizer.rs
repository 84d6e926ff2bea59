//! Engine-agnostic tokens: text, box, script and line cluster.

use serde::{Deserialize, Serialize};

use crate::engine::RawOcrResult;
use crate::geometry::{BBox, NormRect};

/// Confidence assumed for engines that do not report one.
pub const DEFAULT_CONFIDENCE: f32 = 0.9;

/// Fraction of the median token height used as the line tolerance band.
const LINE_TOLERANCE: f32 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Script {
    Latin,
    Cyrillic,
    Greek,
    /// Digits and punctuation only.
    Common,
    Mixed,
}

impl Script {
    pub fn language(&self) -> Option<&'static str> {
        match self {
            Script::Latin => Some("en"),
            Script::Cyrillic => Some("ru"),
            Script::Greek => Some("el"),
            Script::Common | Script::Mixed => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub id: u32,
    pub text: String,
    pub bbox: BBox,
    pub script: Script,
    pub line: u32,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenizedPage {
    pub width: u32,
    pub height: u32,
    /// Reading order: lines top-to-bottom, tokens left-to-right.
    pub tokens: Vec<Token>,
    /// Normalized y centers of horizontal ruling found by the preprocessor.
    #[serde(default)]
    pub rule_lines: Vec<f32>,
    pub detected_language: Option<String>,
}

impl TokenizedPage {
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn line_count(&self) -> usize {
        self.tokens.last().map(|t| t.line as usize + 1).unwrap_or(0)
    }

    /// Tokens grouped by line id, in reading order.
    pub fn lines(&self) -> Vec<&[Token]> {
        self.tokens.chunk_by(|a, b| a.line == b.line).collect()
    }

    pub fn norm(&self, token: &Token) -> NormRect {
        token.bbox.normalized(self.width, self.height)
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.width as f32 / self.height.max(1) as f32
    }

    pub fn median_token_height(&self) -> f32 {
        median(self.tokens.iter().map(|t| t.bbox.h).collect())
    }
}

pub(crate) fn median(mut values: Vec<f32>) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    values[values.len() / 2]
}

/// Tags a word with the script most of its letters belong to.
pub fn detect_script(text: &str) -> Script {
    let (mut latin, mut cyrillic, mut greek) = (0usize, 0usize, 0usize);
    for c in text.chars().filter(|c| c.is_alphabetic()) {
        match c as u32 {
            0x0041..=0x024F => latin += 1,
            0x0370..=0x03FF | 0x1F00..=0x1FFF => greek += 1,
            0x0400..=0x052F => cyrillic += 1,
            _ => {}
        }
    }
    let total = latin + cyrillic + greek;
    if total == 0 {
        return Script::Common;
    }
    let (script, count) = [
        (Script::Latin, latin),
        (Script::Cyrillic, cyrillic),
        (Script::Greek, greek),
    ]
    .into_iter()
    .max_by_key(|(_, n)| *n)
    .unwrap_or((Script::Common, 0));
    if count * 2 > total {
        script
    } else {
        Script::Mixed
    }
}

/// Converts a raw recognition result into line-clustered tokens.
pub fn tokenize(raw: &RawOcrResult, rule_lines: &[f32]) -> TokenizedPage {
    let _span = tracing::info_span!("tokenize", words = raw.words.len()).entered();

    let mut words: Vec<(String, BBox, f32)> = raw
        .words
        .iter()
        .filter_map(|w| {
            let text = w.text.trim();
            if text.is_empty() {
                return None;
            }
            let confidence = w
                .confidence
                .filter(|c| c.is_finite())
                .unwrap_or(DEFAULT_CONFIDENCE)
                .clamp(0.0, 1.0);
            Some((text.to_string(), BBox::new(w.left, w.top, w.width, w.height), confidence))
        })
        .collect();

    let tolerance = LINE_TOLERANCE * median(words.iter().map(|(_, b, _)| b.h).collect()).max(1.0);
    words.sort_by(|a, b| a.1.center_y().total_cmp(&b.1.center_y()));

    // Each line keeps a running mean of its members' vertical centers.
    let mut lines: Vec<(f32, Vec<(String, BBox, f32)>)> = Vec::new();
    for word in words {
        let cy = word.1.center_y();
        match lines.last_mut() {
            Some((mean, members)) if (cy - *mean).abs() <= tolerance => {
                members.push(word);
                *mean = members.iter().map(|(_, b, _)| b.center_y()).sum::<f32>() / members.len() as f32;
            }
            _ => lines.push((cy, vec![word])),
        }
    }

    let mut tokens = Vec::new();
    let mut script_counts = std::collections::HashMap::new();
    for (line_id, (_, mut members)) in lines.into_iter().enumerate() {
        members.sort_by(|a, b| a.1.x.total_cmp(&b.1.x));
        for (text, bbox, confidence) in members {
            let script = detect_script(&text);
            *script_counts.entry(script).or_insert(0usize) += text.chars().count();
            tokens.push(Token {
                id: tokens.len() as u32,
                text,
                bbox,
                script,
                line: line_id as u32,
                confidence,
            });
        }
    }

    let detected_language = script_counts
        .into_iter()
        .filter(|(s, _)| s.language().is_some())
        .max_by_key(|(_, n)| *n)
        .and_then(|(s, _)| s.language())
        .map(str::to_string);

    let (width, height) = if raw.width > 0 && raw.height > 0 {
        (raw.width, raw.height)
    } else {
        // Engines that omit page size: use the token extent.
        let right = tokens.iter().map(|t| t.bbox.right()).fold(1.0_f32, f32::max);
        let bottom = tokens.iter().map(|t| t.bbox.bottom()).fold(1.0_f32, f32::max);
        (right.ceil() as u32, bottom.ceil() as u32)
    };

    tracing::debug!(
        tokens = tokens.len(),
        language = detected_language.as_deref().unwrap_or("unknown"),
        "Tokenized page"
    );

    TokenizedPage {
        width,
        height,
        tokens,
        rule_lines: rule_lines.to_vec(),
        detected_language,
    }
}
