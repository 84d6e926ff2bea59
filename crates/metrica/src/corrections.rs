//! Correction memory: human edits aggregated per tenant, record type,
//! field and normalized original value, replayed on later extractions
//! once a pattern is frequent and consistent enough.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::CorrectionsConfig;
use crate::db::{correction_repo, now, Database, DatabaseError};
use crate::record::{ExtractionMethod, RecordCandidate, RecordType};
use crate::text::normalize_value;

/// A correction applied to a candidate field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedCorrection {
    pub field: String,
    pub from: String,
    pub to: String,
    pub frequency: u32,
    /// Exact normalized match, or similarity of the near match.
    pub similarity: f64,
}

#[derive(Clone)]
pub struct CorrectionMemory {
    db: Database,
    config: CorrectionsConfig,
}

impl CorrectionMemory {
    pub fn new(db: Database, config: CorrectionsConfig) -> Self {
        Self { db, config }
    }

    /// Records one observed edit. Edits that only change case, spacing or
    /// punctuation still count; an unchanged value or an empty original
    /// (nothing to match against later) is ignored. Returns the new
    /// frequency of the pattern.
    pub fn record_correction(
        &self,
        tenant_id: &str,
        record_type: RecordType,
        field: &str,
        original: &str,
        corrected: &str,
    ) -> Result<Option<u32>, DatabaseError> {
        let original_norm = normalize_value(original);
        if original_norm.is_empty() || original.trim() == corrected.trim() {
            return Ok(None);
        }
        let frequency = correction_repo::record(
            &self.db,
            tenant_id,
            record_type.as_str(),
            field,
            &original_norm,
            original.trim(),
            corrected.trim(),
            &now(),
        )?;
        log::debug!(
            "Correction memory: {}.{} pattern now seen {} times",
            record_type,
            field,
            frequency
        );
        Ok(Some(frequency))
    }

    /// Rewrites candidate fields whose value matches a trusted correction.
    pub fn apply_known(
        &self,
        tenant_id: &str,
        candidate: &mut RecordCandidate,
    ) -> Result<Vec<AppliedCorrection>, DatabaseError> {
        let mut applied = Vec::new();
        let record_type = candidate.record_type;
        for (name, field) in candidate.fields.iter_mut() {
            let norm = normalize_value(&field.value);
            if norm.is_empty() {
                continue;
            }
            let entries = correction_repo::list_for_field(&self.db, tenant_id, record_type.as_str(), name)?;
            if entries.is_empty() {
                continue;
            }

            // original_norm -> [(corrected, frequency)], most frequent first.
            let mut patterns: BTreeMap<&str, Vec<(&str, u32)>> = BTreeMap::new();
            for entry in &entries {
                patterns
                    .entry(entry.original_norm.as_str())
                    .or_default()
                    .push((entry.corrected_value.as_str(), entry.frequency));
            }

            let matched = match patterns.get_key_value(norm.as_str()) {
                Some((_, seen)) => Some((seen, 1.0)),
                None => patterns
                    .iter()
                    .map(|(original, seen)| (seen, strsim::normalized_levenshtein(&norm, original)))
                    .filter(|(_, similarity)| *similarity >= self.config.near_match_similarity)
                    .max_by(|a, b| a.1.total_cmp(&b.1)),
            };
            let Some((seen, similarity)) = matched else {
                continue;
            };

            let total: u32 = seen.iter().map(|(_, f)| f).sum();
            let Some(&(corrected, frequency)) = seen.iter().max_by_key(|(_, f)| *f) else {
                continue;
            };
            let trusted = frequency >= self.config.min_frequency
                && frequency as f32 / total.max(1) as f32 >= self.config.dominance;
            if !trusted || field.value == corrected {
                continue;
            }

            let from = std::mem::replace(&mut field.value, corrected.to_string());
            field.confidence = field.confidence.max(self.config.applied_confidence);
            field.method = ExtractionMethod::Correction;
            field.corrected_from = Some(from.clone());
            applied.push(AppliedCorrection {
                field: name.clone(),
                from,
                to: corrected.to_string(),
                frequency,
                similarity,
            });
        }

        if !applied.is_empty() {
            tracing::debug!(count = applied.len(), "Applied known corrections");
        }
        Ok(applied)
    }
}
