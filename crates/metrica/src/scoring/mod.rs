//! Field and record confidence plus cross-field validation.
//!
//! Field confidence is a weighted sum of recognition confidence, match
//! proximity and format conformance. Record confidence averages the mean
//! over required fields (missing ones count as zero) with the mean over
//! all extracted fields.

use crate::config::{ExtractionConfig, ScoreWeights};
use crate::record::{FieldFormat, RecordCandidate, RecordType, Violation, ViolationCode};

pub mod dates;
pub mod validate;

pub use dates::parse_date;

/// How well a value fits the expected shape of its field, in `[0, 1]`.
pub fn format_conformance(format: FieldFormat, value: &str) -> f32 {
    let value = value.trim();
    if value.is_empty() {
        return 0.0;
    }
    match format {
        FieldFormat::Date => {
            if parse_date(value).is_some() {
                1.0
            } else if value.chars().any(|c| c.is_ascii_digit()) {
                0.3
            } else {
                0.0
            }
        }
        FieldFormat::Number => {
            let digits = value.chars().filter(|c| c.is_ascii_digit()).count();
            let alnum = value.chars().filter(|c| c.is_alphanumeric()).count();
            if digits == 0 {
                0.0
            } else if digits == alnum {
                1.0
            } else {
                0.5
            }
        }
        FieldFormat::Name => name_score(value),
        FieldFormat::NameList => {
            let parts: Vec<&str> = split_names(value).collect();
            if parts.is_empty() {
                return 0.0;
            }
            parts.iter().map(|p| name_score(p)).sum::<f32>() / parts.len() as f32
        }
        FieldFormat::Text => 0.8,
    }
}

fn split_names(value: &str) -> impl Iterator<Item = &str> {
    value
        .split([',', ';', '&'])
        .flat_map(|part| part.split(" and ").flat_map(|p| p.split(" и ")).flat_map(|p| p.split(" και ")))
        .map(str::trim)
        .filter(|p| !p.is_empty())
}

fn name_score(value: &str) -> f32 {
    let allowed = |c: char| c.is_alphabetic() || c.is_whitespace() || matches!(c, '-' | '\'' | '.' | '’');
    if value.chars().any(|c| c.is_ascii_digit()) {
        return 0.2;
    }
    if !value.chars().all(allowed) {
        return 0.4;
    }
    let words: Vec<&str> = value.split_whitespace().collect();
    let capitalized = words
        .iter()
        .filter(|w| w.chars().next().is_some_and(|c| c.is_uppercase()))
        .count();
    if capitalized == words.len() {
        1.0
    } else {
        0.7
    }
}

#[derive(Debug, Clone)]
pub struct Scorer {
    weights: ScoreWeights,
    review_threshold: f32,
    age_tolerance_years: u32,
}

impl Scorer {
    pub fn new(config: &ExtractionConfig) -> Self {
        Self {
            weights: config.weights,
            review_threshold: config.field_review_threshold,
            age_tolerance_years: config.age_tolerance_years,
        }
    }

    /// Assigns field confidences and review flags. A low-quality page puts
    /// every field up for review.
    pub fn score(&self, candidate: &mut RecordCandidate, low_quality: bool) {
        let w = self.weights;
        for (name, field) in candidate.fields.iter_mut() {
            let format = format_conformance(FieldFormat::for_field(name), &field.value);
            field.confidence = (w.ocr * field.ocr_confidence + w.proximity * field.proximity + w.format * format)
                .clamp(0.0, 1.0);
            field.needs_review = low_quality || field.confidence < self.review_threshold;
        }
        if low_quality
            && !candidate
                .violations
                .iter()
                .any(|v| v.code == ViolationCode::LowImageQuality)
        {
            candidate.violations.push(Violation {
                code: ViolationCode::LowImageQuality,
                fields: Vec::new(),
                message: "scan quality is below the review threshold".to_string(),
            });
        }
        self.refresh(candidate);
    }

    /// Runs cross-field checks, flags affected fields and recomputes the
    /// record confidence. Returns the new violations.
    pub fn validate(&self, candidate: &mut RecordCandidate) -> Vec<Violation> {
        let found = validate::check(candidate, self.age_tolerance_years);
        for v in &found {
            for name in &v.fields {
                if let Some(field) = candidate.fields.get_mut(name) {
                    field.needs_review = true;
                }
            }
        }
        candidate
            .violations
            .retain(|v| v.code == ViolationCode::LowImageQuality);
        candidate.violations.extend(found.iter().cloned());
        self.refresh(candidate);
        found
    }

    /// Recomputes record confidence and the record-level review flag.
    pub fn refresh(&self, candidate: &mut RecordCandidate) {
        candidate.confidence = record_confidence(candidate);
        candidate.needs_review = !candidate.violations.is_empty()
            || candidate.fields.values().any(|f| f.needs_review)
            || candidate.confidence < self.review_threshold;
    }
}

pub fn record_confidence(candidate: &RecordCandidate) -> f32 {
    combine_confidence(
        candidate.record_type,
        candidate
            .fields
            .iter()
            .map(|(name, f)| (name.as_str(), f.value.as_str(), f.confidence)),
    )
}

/// Record confidence from `(field, value, confidence)` triples. Shared by
/// candidates and reviewed drafts.
pub fn combine_confidence<'a>(
    record_type: RecordType,
    fields: impl IntoIterator<Item = (&'a str, &'a str, f32)>,
) -> f32 {
    let fields: Vec<(&str, &str, f32)> = fields.into_iter().collect();
    if fields.is_empty() {
        return 0.0;
    }
    let all = fields.iter().map(|f| f.2).sum::<f32>() / fields.len() as f32;
    let required = record_type.required_fields();
    if required.is_empty() {
        return all.clamp(0.0, 1.0);
    }
    let req = required
        .iter()
        .map(|name| {
            fields
                .iter()
                .find(|(n, value, _)| n == name && !value.trim().is_empty())
                .map_or(0.0, |f| f.2)
        })
        .sum::<f32>()
        / required.len() as f32;
    ((req + all) / 2.0).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{fields, ExtractionMethod, FieldValue, RecordType};

    fn field(value: &str, ocr: f32, proximity: f32) -> FieldValue {
        FieldValue::extracted(value.to_string(), ExtractionMethod::Anchor, vec![0], ocr, proximity)
    }

    #[test]
    fn test_format_conformance() {
        assert_eq!(format_conformance(FieldFormat::Date, "12.03.1911"), 1.0);
        assert_eq!(format_conformance(FieldFormat::Date, "12.1911"), 0.3);
        assert_eq!(format_conformance(FieldFormat::Name, "Anna Petrova"), 1.0);
        assert_eq!(format_conformance(FieldFormat::Name, "anna petrova"), 0.7);
        assert_eq!(format_conformance(FieldFormat::Name, "Anna 5"), 0.2);
        assert_eq!(format_conformance(FieldFormat::Number, "17"), 1.0);
        assert_eq!(format_conformance(FieldFormat::Number, "No 17"), 0.5);
        assert_eq!(
            format_conformance(FieldFormat::NameList, "Ivan Sidorov, Maria Sidorova"),
            1.0
        );
        assert_eq!(format_conformance(FieldFormat::Text, ""), 0.0);
    }

    #[test]
    fn test_field_and_record_confidence() {
        let scorer = Scorer::new(&ExtractionConfig::default());
        let mut c = RecordCandidate::new(RecordType::Baptism);
        c.fields.insert(fields::FULL_NAME.into(), field("Anna Petrova", 0.9, 1.0));
        c.fields.insert(fields::BAPTISM_DATE.into(), field("12.03.1911", 0.8, 1.0));
        c.fields.insert(fields::CLERGY.into(), field("fr. ioann", 0.4, 0.3));
        scorer.score(&mut c, false);

        let name = &c.fields[fields::FULL_NAME];
        assert!((name.confidence - 0.95).abs() < 1e-5);
        assert!(!name.needs_review);
        let clergy = &c.fields[fields::CLERGY];
        // 0.5*0.4 + 0.2*0.3 + 0.3*0.7
        assert!((clergy.confidence - 0.47).abs() < 1e-5);
        assert!(clergy.needs_review);
        assert!(c.needs_review);
        assert!(c.confidence > 0.0 && c.confidence <= 1.0);
    }

    #[test]
    fn test_missing_required_lowers_record_confidence() {
        let scorer = Scorer::new(&ExtractionConfig::default());
        let mut c = RecordCandidate::new(RecordType::Marriage);
        c.fields.insert(fields::GROOM_NAME.into(), field("Ivan Petrov", 1.0, 1.0));
        scorer.score(&mut c, false);
        let violations = scorer.validate(&mut c);
        assert_eq!(violations.len(), 2);
        // required mean 1/3, all-field mean 1.0
        assert!((c.confidence - (1.0 / 3.0 + 1.0) / 2.0).abs() < 1e-5);
        assert!(c.needs_review);
    }

    #[test]
    fn test_low_quality_forces_review() {
        let scorer = Scorer::new(&ExtractionConfig::default());
        let mut c = RecordCandidate::new(RecordType::Baptism);
        c.fields.insert(fields::FULL_NAME.into(), field("Anna Petrova", 1.0, 1.0));
        c.fields.insert(fields::BAPTISM_DATE.into(), field("12.03.1911", 1.0, 1.0));
        scorer.score(&mut c, true);
        scorer.validate(&mut c);
        assert!(c.fields.values().all(|f| f.needs_review));
        assert_eq!(c.violations.len(), 1);
        assert_eq!(c.violations[0].code, ViolationCode::LowImageQuality);
    }

    #[test]
    fn test_validate_flags_affected_fields() {
        let scorer = Scorer::new(&ExtractionConfig::default());
        let mut c = RecordCandidate::new(RecordType::Baptism);
        c.fields.insert(fields::FULL_NAME.into(), field("Anna Petrova", 1.0, 1.0));
        c.fields.insert(fields::BIRTH_DATE.into(), field("20.03.1911", 1.0, 1.0));
        c.fields.insert(fields::BAPTISM_DATE.into(), field("12.03.1911", 1.0, 1.0));
        scorer.score(&mut c, false);
        assert!(!c.needs_review);
        scorer.validate(&mut c);
        assert!(c.fields[fields::BIRTH_DATE].needs_review);
        assert!(!c.fields[fields::FULL_NAME].needs_review);
        assert!(c.needs_review);
    }
}
