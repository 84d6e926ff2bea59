//! Record type classification from keyword hits and page shape.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::record::RecordType;
use crate::text::fold;
use crate::tokenizer::{Token, TokenizedPage};

pub mod keywords;

/// Occurrences of one phrase beyond this add nothing; ledgers repeat
/// labels on every row.
const MAX_HITS_PER_PHRASE: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageShape {
    /// One record laid out as a certificate or free text block.
    SingleRecord,
    /// Rows and columns, many records per page.
    Tabular,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub record_type: RecordType,
    pub confidence: f32,
    pub shape: PageShape,
    pub scores: BTreeMap<RecordType, f32>,
}

impl Classification {
    pub fn is_unknown(&self) -> bool {
        self.record_type == RecordType::Unknown
    }
}

#[derive(Debug, Clone)]
pub struct Classifier {
    min_confidence: f32,
}

impl Classifier {
    pub fn new(min_confidence: f32) -> Self {
        Self { min_confidence }
    }

    pub fn classify(&self, page: &TokenizedPage) -> Classification {
        let _span = tracing::info_span!("classify", tokens = page.tokens.len()).entered();

        let (shape, clarity) = page_shape(page);
        let text = fold(
            &page
                .tokens
                .iter()
                .map(|t| t.text.as_str())
                .collect::<Vec<_>>()
                .join(" "),
        );

        let scores: BTreeMap<RecordType, f32> = RecordType::KNOWN
            .iter()
            .map(|rt| (*rt, keyword_score(&text, *rt)))
            .collect();

        let mut ranked: Vec<(RecordType, f32)> = scores.iter().map(|(k, v)| (*k, *v)).collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        let (best_type, best) = ranked[0];
        let second = ranked.get(1).map(|r| r.1).unwrap_or(0.0);

        let (record_type, confidence) = if best <= 0.0 {
            (RecordType::Unknown, 0.0)
        } else {
            let strength = 1.0 - (-best / 3.0).exp();
            let margin = (best - second) / best;
            let confidence = (0.6 * strength + 0.3 * margin + 0.1 * clarity).clamp(0.0, 1.0);
            if confidence < self.min_confidence {
                (RecordType::Unknown, confidence)
            } else {
                (best_type, confidence)
            }
        };

        tracing::info!(
            record_type = %record_type,
            confidence,
            shape = ?shape,
            "Classified page"
        );

        Classification {
            record_type,
            confidence,
            shape,
            scores,
        }
    }
}

fn keyword_score(folded_text: &str, record_type: RecordType) -> f32 {
    let count = |phrase: &str| folded_text.matches(fold(phrase).as_str()).count().min(MAX_HITS_PER_PHRASE);
    let anchors: usize = keywords::anchors(record_type).iter().map(|p| count(p)).sum();
    let words: usize = keywords::keywords(record_type).iter().map(|p| count(p)).sum();
    anchors as f32 * keywords::ANCHOR_WEIGHT + words as f32 * keywords::KEYWORD_WEIGHT
}

/// Number of horizontally separated groups on a line. A gap wider than
/// twice the median token height splits groups.
pub fn line_groups(line: &[Token], split_gap: f32) -> usize {
    if line.is_empty() {
        return 0;
    }
    1 + line
        .windows(2)
        .filter(|w| w[1].bbox.x - w[0].bbox.right() > split_gap)
        .count()
}

/// Shape of the page and how clearly it fits that shape, in `[0, 1]`.
pub fn page_shape(page: &TokenizedPage) -> (PageShape, f32) {
    let lines = page.lines();
    if lines.is_empty() {
        return (PageShape::SingleRecord, 0.0);
    }
    let split_gap = 2.0 * page.median_token_height().max(1.0);
    let multi = lines.iter().filter(|l| line_groups(l, split_gap) >= 3).count();
    let fraction = multi as f32 / lines.len() as f32;
    let wide_boost = if page.aspect_ratio() > 1.2 { 0.2 } else { 0.0 };

    if lines.len() >= 4 && fraction + wide_boost / 2.0 >= 0.5 {
        (PageShape::Tabular, (fraction + wide_boost).min(1.0))
    } else {
        (PageShape::SingleRecord, (1.0 - fraction).clamp(0.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{RawOcrResult, RawWord};
    use crate::tokenizer::tokenize;

    fn page(lines: &[&[(&str, f32)]], width: u32, height: u32) -> TokenizedPage {
        let mut words = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            for (text, x) in line.iter() {
                words.push(RawWord {
                    text: text.to_string(),
                    left: *x,
                    top: 50.0 + i as f32 * 40.0,
                    width: 12.0 * text.chars().count() as f32,
                    height: 20.0,
                    confidence: Some(0.9),
                });
            }
        }
        tokenize(
            &RawOcrResult {
                engine: "test".into(),
                width,
                height,
                words,
            },
            &[],
        )
    }

    #[test]
    fn test_baptism_certificate() {
        let p = page(
            &[
                &[("Certificate", 300.0), ("of", 450.0), ("Baptism", 490.0)],
                &[("Name:", 100.0), ("Anna", 200.0), ("Petrova", 260.0)],
                &[("Date", 100.0), ("of", 160.0), ("Baptism:", 190.0), ("12.03.1911", 300.0)],
                &[("Sponsors:", 100.0), ("Ivan", 220.0), ("Sidorov", 280.0)],
            ],
            1000,
            1400,
        );
        let c = Classifier::new(0.3).classify(&p);
        assert_eq!(c.record_type, RecordType::Baptism);
        assert_eq!(c.shape, PageShape::SingleRecord);
        assert!(c.confidence > 0.8, "confidence {}", c.confidence);
    }

    #[test]
    fn test_greek_and_russian_keywords() {
        let greek = page(&[&[("ΠΙΣΤΟΠΟΙΗΤΙΚΟ", 100.0), ("ΓΑΜΟΥ", 400.0)], &[("Γαμπρός", 100.0)]], 1000, 1400);
        assert_eq!(Classifier::new(0.3).classify(&greek).record_type, RecordType::Marriage);

        let russian = page(&[&[("Причина", 100.0), ("смерти:", 300.0)], &[("умер", 100.0)]], 1000, 1400);
        assert_eq!(Classifier::new(0.3).classify(&russian).record_type, RecordType::Funeral);
    }

    #[test]
    fn test_no_keywords_is_unknown() {
        let p = page(&[&[("Lorem", 100.0), ("ipsum", 200.0)]], 1000, 1400);
        let c = Classifier::new(0.3).classify(&p);
        assert!(c.is_unknown());
        assert_eq!(c.confidence, 0.0);
    }

    #[test]
    fn test_ambiguous_page_below_threshold_is_unknown() {
        // One weak hit for each of two types: no margin, little strength.
        let p = page(&[&[("born", 100.0), ("died", 300.0)]], 1000, 1400);
        let c = Classifier::new(0.3).classify(&p);
        assert!(c.is_unknown(), "{:?}", c);
    }

    #[test]
    fn test_tabular_shape() {
        let row: &[(&str, f32)] = &[("1", 20.0), ("Ivan", 200.0), ("Anna", 600.0), ("Fr.", 1000.0)];
        let p = page(&[row, row, row, row, row], 1400, 1000);
        assert_eq!(page_shape(&p).0, PageShape::Tabular);
    }
}
