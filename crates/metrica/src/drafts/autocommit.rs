//! Threshold auto-commit: which extracted candidates may skip review, and
//! the batches that record what was committed so it can be rolled back.

use serde::Serialize;

use crate::record::{FieldFormat, RecordCandidate};
use crate::scoring::parse_date;

/// Reviewer recorded on drafts committed without review.
pub const AUTOCOMMIT_ACTOR: &str = "autocommit";
/// Ledger pages below this table structure score are never auto-committed.
pub const MIN_STRUCTURE_SCORE: f32 = 0.70;
/// Share of non-empty fields that must point back at page tokens.
pub const MIN_SOURCE_COVERAGE: f32 = 0.80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipReason {
    RowScoreLow,
    MissingRequired,
    UnparseableDate,
    Violations,
    FieldsFlagged,
    NoProvenance,
    ProvenanceLow,
    StructureLow,
    NoStructureScore,
}

/// Every reason the candidate must go through review. Empty means it may
/// be committed directly.
pub fn skip_reasons(candidate: &RecordCandidate, threshold: f32) -> Vec<SkipReason> {
    let mut reasons = Vec::new();
    if candidate.confidence < threshold {
        reasons.push(SkipReason::RowScoreLow);
    }
    if candidate
        .record_type
        .required_fields()
        .iter()
        .any(|name| candidate.value(name).is_none())
    {
        reasons.push(SkipReason::MissingRequired);
    }
    let bad_date = candidate.fields.iter().any(|(name, f)| {
        FieldFormat::for_field(name) == FieldFormat::Date
            && !f.value.trim().is_empty()
            && parse_date(f.value.trim()).is_none()
    });
    if bad_date {
        reasons.push(SkipReason::UnparseableDate);
    }
    if !candidate.violations.is_empty() {
        reasons.push(SkipReason::Violations);
    }
    if candidate.needs_review || candidate.fields.values().any(|f| f.needs_review) {
        reasons.push(SkipReason::FieldsFlagged);
    }

    let templated = candidate.template_id.is_some();
    let filled = candidate.fields.values().filter(|f| !f.value.trim().is_empty()).count();
    let sourced = filled - candidate.unsourced_fields().len();
    if sourced == 0 {
        if !templated {
            reasons.push(SkipReason::NoProvenance);
        }
    } else if (sourced as f32) < MIN_SOURCE_COVERAGE * filled as f32 {
        reasons.push(SkipReason::ProvenanceLow);
    }

    match candidate.structure_score {
        Some(score) if score < MIN_STRUCTURE_SCORE => reasons.push(SkipReason::StructureLow),
        None if !templated => reasons.push(SkipReason::NoStructureScore),
        _ => {}
    }
    reasons
}

/// Outcome of one auto-commit run over a job's drafts.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoCommitBatch {
    pub id: String,
    pub job_id: String,
    pub tenant_id: String,
    pub threshold: f32,
    /// `(draft_id, record_id)` of every draft committed by the batch.
    pub committed: Vec<(String, String)>,
    /// Drafts that were offered but stayed in review.
    pub skipped: usize,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackReport {
    pub batch_id: String,
    /// Records removed from the records store.
    pub deleted: usize,
    /// Records that were already gone.
    pub missing: usize,
    /// Drafts sent back to review.
    pub reopened: usize,
    /// The batch had been rolled back before; nothing was changed.
    pub already_rolled_back: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BBox;
    use crate::record::{fields, ExtractionMethod, FieldValue, RecordType, SourceRegion, Violation, ViolationCode};

    fn field(value: &str) -> FieldValue {
        let mut f = FieldValue::extracted(value.to_string(), ExtractionMethod::Column, vec![1], 0.97, 1.0);
        f.confidence = 0.96;
        f.source = Some(SourceRegion {
            bbox: BBox::new(10.0, 10.0, 100.0, 20.0),
            confidence: 0.97,
        });
        f
    }

    fn ledger_row() -> RecordCandidate {
        let mut c = RecordCandidate::new(RecordType::Marriage);
        c.fields.insert(fields::GROOM_NAME.to_string(), field("Ivan Petrov"));
        c.fields.insert(fields::BRIDE_NAME.to_string(), field("Anna Orlova"));
        c.fields.insert(fields::MARRIAGE_DATE.to_string(), field("12.05.1912"));
        c.confidence = 0.95;
        c.row_index = Some(0);
        c.structure_score = Some(0.9);
        c
    }

    #[test]
    fn test_clean_row_is_eligible() {
        assert!(skip_reasons(&ledger_row(), 0.92).is_empty());
    }

    #[test]
    fn test_threshold_is_configurable() {
        let mut row = ledger_row();
        row.confidence = 0.85;
        assert_eq!(skip_reasons(&row, 0.92), vec![SkipReason::RowScoreLow]);
        assert!(skip_reasons(&row, 0.80).is_empty());
    }

    #[test]
    fn test_reasons_accumulate() {
        let mut row = ledger_row();
        row.confidence = 0.80;
        row.fields.remove(fields::BRIDE_NAME);
        row.fields.insert(fields::MARRIAGE_DATE.to_string(), field("1?.05.19"));
        row.structure_score = Some(0.5);
        let reasons = skip_reasons(&row, 0.92);
        assert_eq!(
            reasons,
            vec![
                SkipReason::RowScoreLow,
                SkipReason::MissingRequired,
                SkipReason::UnparseableDate,
                SkipReason::StructureLow,
            ]
        );
    }

    #[test]
    fn test_flags_and_violations_block() {
        let mut row = ledger_row();
        row.fields.get_mut(fields::GROOM_NAME).unwrap().needs_review = true;
        row.violations.push(Violation {
            code: ViolationCode::LowImageQuality,
            message: "scan too dark".into(),
            fields: Vec::new(),
        });
        let reasons = skip_reasons(&row, 0.92);
        assert!(reasons.contains(&SkipReason::FieldsFlagged));
        assert!(reasons.contains(&SkipReason::Violations));
    }

    #[test]
    fn test_provenance_coverage() {
        let mut row = ledger_row();
        row.fields.get_mut(fields::GROOM_NAME).unwrap().source = None;
        row.fields.get_mut(fields::BRIDE_NAME).unwrap().source = None;
        assert_eq!(skip_reasons(&row, 0.92), vec![SkipReason::ProvenanceLow]);

        for f in row.fields.values_mut() {
            f.source = None;
        }
        assert_eq!(skip_reasons(&row, 0.92), vec![SkipReason::NoProvenance]);

        // A matched template vouches for field positions.
        row.template_id = Some("marriage-register".into());
        assert!(skip_reasons(&row, 0.92).is_empty());
    }

    #[test]
    fn test_structure_score_needed_without_template() {
        let mut row = ledger_row();
        row.structure_score = None;
        assert_eq!(skip_reasons(&row, 0.92), vec![SkipReason::NoStructureScore]);
        row.template_id = Some("marriage-register".into());
        assert!(skip_reasons(&row, 0.92).is_empty());
    }
}
