//! Anchor and search-zone extraction for single-record pages, with a
//! quadrant fallback for fields whose anchor is missing.

use std::collections::HashSet;

use crate::config::ExtractionConfig;
use crate::geometry::NormRect;
use crate::record::{fields, ExtractionMethod, FieldFormat, FieldValue, RecordCandidate};
use crate::scoring::format_conformance;
use crate::text::normalize_value;
use crate::tokenizer::{Token, TokenizedPage};

use super::{FieldSpec, LayoutTemplate, TemplateKind};

/// A token counts as inside a zone when this share of its box is.
const MIN_ZONE_COVERAGE: f32 = 0.5;
/// Proximity granted to values found without an anchor.
const QUADRANT_PROXIMITY_CAP: f32 = 0.3;
const QUADRANT_MIN_FORMAT: f32 = 0.5;

/// One place on the page where an anchor phrase was recognized.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorHit {
    /// Token ids covered by the match, consecutive on one line.
    pub tokens: Vec<u32>,
    pub rect: NormRect,
    pub similarity: f64,
    pub line: u32,
}

/// Finds `phrase` in `lines` by comparing it against windows of 1..=n+1
/// consecutive tokens (n = words in the phrase). Overlapping matches keep
/// the most similar one.
pub fn find_anchors(
    page: &TokenizedPage,
    lines: &[&[Token]],
    phrase: &str,
    min_similarity: f64,
) -> Vec<AnchorHit> {
    let target = normalize_value(phrase);
    if target.is_empty() {
        return Vec::new();
    }
    let words = target.split(' ').count();

    let mut hits = Vec::new();
    for line in lines {
        for start in 0..line.len() {
            for width in 1..=(words + 1).min(line.len() - start) {
                let window = &line[start..start + width];
                let text = normalize_value(
                    &window.iter().map(|t| t.text.as_str()).collect::<Vec<_>>().join(" "),
                );
                if text.is_empty() {
                    continue;
                }
                let similarity = strsim::normalized_levenshtein(&text, &target);
                if similarity >= min_similarity {
                    hits.push(AnchorHit {
                        tokens: window.iter().map(|t| t.id).collect(),
                        rect: span_rect(page, window),
                        similarity,
                        line: window[0].line,
                    });
                }
            }
        }
    }
    dedupe_overlapping(hits)
}

fn dedupe_overlapping(mut hits: Vec<AnchorHit>) -> Vec<AnchorHit> {
    hits.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then(b.tokens.len().cmp(&a.tokens.len()))
            .then(a.tokens[0].cmp(&b.tokens[0]))
    });
    let mut kept: Vec<AnchorHit> = Vec::new();
    for hit in hits {
        if !kept.iter().any(|k| k.tokens.iter().any(|id| hit.tokens.contains(id))) {
            kept.push(hit);
        }
    }
    kept.sort_by_key(|h| h.tokens[0]);
    kept
}

fn span_rect(page: &TokenizedPage, tokens: &[Token]) -> NormRect {
    let bbox = tokens[1..]
        .iter()
        .fold(tokens[0].bbox, |acc, t| acc.union(&t.bbox));
    bbox.normalized(page.width, page.height)
}

/// Consecutive same-line tokens considered as one value.
struct Run<'a> {
    tokens: Vec<&'a Token>,
    rect: NormRect,
}

impl Run<'_> {
    fn text(&self) -> String {
        self.tokens.iter().map(|t| t.text.as_str()).collect::<Vec<_>>().join(" ")
    }

    fn ocr_confidence(&self) -> f32 {
        self.tokens.iter().map(|t| t.confidence).sum::<f32>() / self.tokens.len() as f32
    }

    fn ids(&self) -> Vec<u32> {
        self.tokens.iter().map(|t| t.id).collect()
    }
}

#[derive(Debug, Clone)]
pub struct LayoutExtractor {
    anchor_similarity: f64,
    min_token_confidence: f32,
}

impl LayoutExtractor {
    pub fn new(config: &ExtractionConfig) -> Self {
        Self {
            anchor_similarity: config.anchor_similarity,
            min_token_confidence: config.min_token_confidence,
        }
    }

    pub fn anchor_similarity(&self) -> f64 {
        self.anchor_similarity
    }

    /// Extracts one record. Fields whose anchor is absent fall back to the
    /// quadrant heuristic; fields found by neither are left out.
    pub fn extract(&self, page: &TokenizedPage, template: &LayoutTemplate, mismatch: bool) -> RecordCandidate {
        let _span = tracing::info_span!("extract", strategy = "layout", template = %template.id).entered();

        let mut candidate = RecordCandidate::new(template.record_type);
        candidate.template_id = Some(template.id.clone());
        let TemplateKind::Layout { fields: specs } = &template.kind else {
            return candidate;
        };

        let lines = page.lines();
        let field_hits: Vec<Vec<AnchorHit>> = specs
            .iter()
            .map(|spec| self.hits_for(page, &lines, spec))
            .collect();
        let chosen = self.choose_hits(page, specs, &field_hits);

        // Only chosen labels stay reserved. Other hits are released when they
        // sit inside a chosen value zone, so "St. Nicholas Church" keeps its
        // last word.
        let zones: Vec<NormRect> = specs
            .iter()
            .zip(&field_hits)
            .zip(&chosen)
            .filter_map(|((spec, hits), c)| c.map(|i| spec.zone.resolve(&hits[i].rect)))
            .collect();
        let mut used: HashSet<u32> = HashSet::new();
        for (hits, c) in field_hits.iter().zip(&chosen) {
            for (i, hit) in hits.iter().enumerate() {
                let inside_value = zones.iter().any(|z| hit.rect.coverage_in(z) >= MIN_ZONE_COVERAGE);
                if Some(i) == *c || !inside_value {
                    used.extend(hit.tokens.iter().copied());
                }
            }
        }

        let mut missing = Vec::new();
        for ((spec, hits), c) in specs.iter().zip(&field_hits).zip(&chosen) {
            let value = c.and_then(|i| self.anchored_value(page, spec, &hits[i..=i], &used));
            match value {
                Some((_, value)) => {
                    used.extend(value.token_ids.iter().copied());
                    candidate.fields.insert(spec.field.clone(), value);
                }
                None => missing.push(spec.field.as_str()),
            }
        }

        for field in missing {
            if let Some(value) = self.quadrant_value(page, field, &used) {
                used.extend(value.token_ids.iter().copied());
                candidate.fields.insert(field.to_string(), value);
            }
        }

        if mismatch {
            candidate.needs_review = true;
        }
        tracing::debug!(
            fields = candidate.fields.len(),
            expected = specs.len(),
            mismatch,
            "Layout extraction finished"
        );
        candidate
    }

    /// Picks the anchor hit each field reads from, with every recognized
    /// label kept out of the values.
    fn choose_hits(&self, page: &TokenizedPage, specs: &[FieldSpec], field_hits: &[Vec<AnchorHit>]) -> Vec<Option<usize>> {
        let mut used: HashSet<u32> = field_hits
            .iter()
            .flatten()
            .flat_map(|h| h.tokens.iter().copied())
            .collect();
        specs
            .iter()
            .zip(field_hits)
            .map(|(spec, hits)| {
                let (index, value) = self.anchored_value(page, spec, hits, &used)?;
                used.extend(value.token_ids.iter().copied());
                Some(index)
            })
            .collect()
    }

    fn hits_for(&self, page: &TokenizedPage, lines: &[&[Token]], spec: &FieldSpec) -> Vec<AnchorHit> {
        let all: Vec<AnchorHit> = spec
            .anchors
            .iter()
            .flat_map(|phrase| find_anchors(page, lines, phrase, self.anchor_similarity))
            .collect();
        dedupe_overlapping(all)
    }

    fn eligible(&self, token: &Token, used: &HashSet<u32>) -> bool {
        token.confidence >= self.min_token_confidence && !used.contains(&token.id)
    }

    /// Maximal runs of eligible tokens on one line that lie inside `zone`.
    fn runs_in<'a>(&self, page: &'a TokenizedPage, zone: &NormRect, used: &HashSet<u32>) -> Vec<Run<'a>> {
        let mut runs: Vec<Run<'a>> = Vec::new();
        let mut last: Option<&Token> = None;
        for token in &page.tokens {
            let inside = self.eligible(token, used) && page.norm(token).coverage_in(zone) >= MIN_ZONE_COVERAGE;
            if !inside {
                last = None;
                continue;
            }
            let rect = page.norm(token);
            match (runs.last_mut(), last) {
                (Some(run), Some(prev)) if prev.line == token.line && prev.id + 1 == token.id => {
                    run.tokens.push(token);
                    run.rect = NormRect::new(
                        run.rect.x0.min(rect.x0),
                        run.rect.y0.min(rect.y0),
                        run.rect.x1.max(rect.x1),
                        run.rect.y1.max(rect.y1),
                    );
                }
                _ => runs.push(Run {
                    tokens: vec![token],
                    rect,
                }),
            }
            last = Some(token);
        }
        runs
    }

    fn anchored_value(
        &self,
        page: &TokenizedPage,
        spec: &FieldSpec,
        hits: &[AnchorHit],
        used: &HashSet<u32>,
    ) -> Option<(usize, FieldValue)> {
        let format = FieldFormat::for_field(&spec.field);

        // Per hit: the most plausible run, its distance and position score.
        let mut best: Option<(f32, usize, Run<'_>, f32)> = None;
        for (index, hit) in hits.iter().enumerate() {
            let zone = spec.zone.resolve(&hit.rect);
            let scale = zone.width().max(zone.height()).max(f32::EPSILON);
            let chosen = self
                .runs_in(page, &zone, used)
                .into_iter()
                .map(|run| {
                    let distance = hit.rect.distance_to(&run.rect);
                    let position = (1.0 - distance / scale).clamp(0.0, 1.0);
                    let plausibility = 0.5 * position + 0.5 * format_conformance(format, &run.text());
                    (plausibility, distance, position, run)
                })
                .fold(None, |acc: Option<(f32, f32, f32, Run<'_>)>, item| match acc {
                    Some(a) if a.0 >= item.0 => Some(a),
                    _ => Some(item),
                });
            let Some((_, distance, position, run)) = chosen else {
                continue;
            };
            // Hits arrive in reading order, so ties keep the earlier one.
            if best.as_ref().map_or(true, |(d, ..)| distance < *d) {
                best = Some((distance, index, run, position));
            }
        }

        let (_, index, run, position) = best?;
        let value = FieldValue::extracted(
            run.text(),
            ExtractionMethod::Anchor,
            run.ids(),
            run.ocr_confidence(),
            position * hits[index].similarity as f32,
        );
        Some((index, value))
    }

    fn quadrant_value(&self, page: &TokenizedPage, field: &str, used: &HashSet<u32>) -> Option<FieldValue> {
        let format = FieldFormat::for_field(field);
        let region = quadrant(field, format)?;
        let mut best: Option<(f32, Run<'_>)> = None;
        for run in self.runs_in(page, &region, used) {
            let score = format_conformance(format, &run.text());
            if score < QUADRANT_MIN_FORMAT {
                continue;
            }
            if best.as_ref().map_or(true, |(s, _)| score > *s) {
                best = Some((score, run));
            }
        }
        let (score, run) = best?;
        Some(FieldValue::extracted(
            run.text(),
            ExtractionMethod::Quadrant,
            run.ids(),
            run.ocr_confidence(),
            (QUADRANT_PROXIMITY_CAP * score).min(QUADRANT_PROXIMITY_CAP),
        ))
    }
}

/// Coarse page region where a field tends to sit on certificates: names
/// top-left, dates top-right, sponsors and witnesses in the lower half
/// with the officiating clergy signing at the bottom.
fn quadrant(field: &str, format: FieldFormat) -> Option<NormRect> {
    use fields::*;
    match (field, format) {
        (CLERGY, _) => Some(NormRect::new(0.0, 0.75, 1.0, 1.0)),
        (SPONSORS | WITNESSES, _) => Some(NormRect::new(0.0, 0.5, 1.0, 0.8)),
        (_, FieldFormat::Name) => Some(NormRect::new(0.0, 0.1, 0.5, 0.5)),
        (_, FieldFormat::Date) => Some(NormRect::new(0.5, 0.0, 1.0, 0.5)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{RawOcrResult, RawWord};
    use crate::layout::builtin;
    use crate::tokenizer::tokenize;

    fn word(text: &str, left: f32, top: f32, confidence: f32) -> RawWord {
        RawWord {
            text: text.to_string(),
            left,
            top,
            width: 12.0 * text.chars().count() as f32,
            height: 20.0,
            confidence: Some(confidence),
        }
    }

    fn line(text: &str, left: f32, top: f32) -> Vec<RawWord> {
        let mut x = left;
        text.split_whitespace()
            .map(|w| {
                let word = word(w, x, top, 0.95);
                x += word.width + 10.0;
                word
            })
            .collect()
    }

    fn page(lines: &[(&str, f32, f32)]) -> TokenizedPage {
        let words = lines.iter().flat_map(|(t, x, y)| line(t, *x, *y)).collect();
        tokenize(
            &RawOcrResult {
                engine: "test".into(),
                width: 1000,
                height: 1400,
                words,
            },
            &[],
        )
    }

    fn extractor() -> LayoutExtractor {
        LayoutExtractor::new(&ExtractionConfig::default())
    }

    #[test]
    fn test_find_anchors_multi_word_and_fuzzy() {
        let p = page(&[("Date of Baptlsm: 12 March 1911", 50.0, 100.0)]);
        let hits = find_anchors(&p, &p.lines(), "Date of Baptism", 0.8);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tokens, vec![0, 1, 2]);
        assert!(hits[0].similarity < 1.0);
    }

    #[test]
    fn test_extracts_certificate_fields() {
        let p = page(&[
            ("CERTIFICATE OF BAPTISM", 300.0, 60.0),
            ("Name: Anna Petrova", 50.0, 200.0),
            ("Date of Birth: 3 March 1911", 50.0, 260.0),
            ("Date of Baptism: 12 March 1911", 50.0, 320.0),
            ("Sponsors: Ivan Sidorov, Maria Sidorova", 50.0, 380.0),
            ("Priest: Fr. Ioann Smirnov", 50.0, 440.0),
        ]);
        let c = extractor().extract(&p, &builtin::baptism_certificate(), false);
        assert_eq!(c.value(fields::FULL_NAME), Some("Anna Petrova"));
        assert_eq!(c.value(fields::BIRTH_DATE), Some("3 March 1911"));
        assert_eq!(c.value(fields::BAPTISM_DATE), Some("12 March 1911"));
        assert_eq!(c.value(fields::SPONSORS), Some("Ivan Sidorov, Maria Sidorova"));
        assert_eq!(c.value(fields::CLERGY), Some("Fr. Ioann Smirnov"));
        assert_eq!(c.fields[fields::FULL_NAME].method, ExtractionMethod::Anchor);
        assert!(c.fields[fields::FULL_NAME].proximity > 0.9);
        assert_eq!(c.template_id.as_deref(), Some("baptism-certificate-v1"));
        assert!(!c.needs_review);
    }

    #[test]
    fn test_value_may_contain_an_anchor_word() {
        let p = page(&[
            ("Name: Anna Petrova", 50.0, 200.0),
            ("Church: St. Nicholas Church", 50.0, 500.0),
        ]);
        let c = extractor().extract(&p, &builtin::baptism_certificate(), false);
        assert_eq!(c.value(fields::CHURCH), Some("St. Nicholas Church"));
        assert_eq!(c.value(fields::FULL_NAME), Some("Anna Petrova"));
    }

    #[test]
    fn test_multiple_anchor_hits_choose_tightest() {
        // The second "Name" label has its value far to the right.
        let p = page(&[
            ("Name: Anna Petrova", 50.0, 200.0),
            ("Name:", 50.0, 500.0),
            ("Olga", 600.0, 500.0),
        ]);
        let c = extractor().extract(&p, &builtin::baptism_certificate(), false);
        assert_eq!(c.value(fields::FULL_NAME), Some("Anna Petrova"));
    }

    #[test]
    fn test_low_confidence_tokens_are_not_values() {
        let mut words = line("Name:", 50.0, 200.0);
        words.push(word("Anna", 130.0, 200.0, 0.1));
        words.push(word("Petrova", 200.0, 200.0, 0.9));
        let p = tokenize(
            &RawOcrResult {
                engine: "test".into(),
                width: 1000,
                height: 1400,
                words,
            },
            &[],
        );
        let c = extractor().extract(&p, &builtin::baptism_certificate(), false);
        assert_eq!(c.value(fields::FULL_NAME), Some("Petrova"));
    }

    #[test]
    fn test_quadrant_fallback_without_anchors() {
        let p = page(&[
            ("Anna Petrova", 100.0, 300.0),
            ("12.03.1911", 700.0, 300.0),
            ("Fr. Ioann Smirnov", 100.0, 1200.0),
        ]);
        let c = extractor().extract(&p, &builtin::baptism_certificate(), true);
        let name = &c.fields[fields::FULL_NAME];
        assert_eq!(name.value, "Anna Petrova");
        assert_eq!(name.method, ExtractionMethod::Quadrant);
        assert!(name.proximity <= QUADRANT_PROXIMITY_CAP);
        assert_eq!(c.value(fields::BIRTH_DATE), Some("12.03.1911"));
        assert_eq!(c.value(fields::CLERGY), Some("Fr. Ioann Smirnov"));
        assert!(c.value(fields::CHURCH).is_none());
        assert!(c.needs_review);
    }
}
