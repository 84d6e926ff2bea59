//! Fusion drafts: the reviewable wrapper around an extracted candidate and
//! the review workflow that turns it into a committed record.
//!
//! Every status change is a compare-and-swap on `workflow_status`, so two
//! reviewers racing on the same draft cannot both win. Payload edits are
//! guarded the same way: they only land while the draft is still in the
//! status they were validated against.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::corrections::CorrectionMemory;
use crate::db::autocommit_repo::{self, BatchRow};
use crate::db::draft_repo::{self, DraftFilter, DraftRow, TransitionUpdate};
use crate::db::{now, Database};
use crate::error::DraftError;
use crate::record::{
    ExtractionMethod, FieldValue, RecordCandidate, RecordType, SourceRegion, Violation, ViolationCode,
};
use crate::scoring::{combine_confidence, validate};

pub mod autocommit;
pub mod records_store;
pub mod state;

pub use autocommit::{skip_reasons, AutoCommitBatch, RollbackReport, SkipReason};
pub use records_store::{Provenance, RecordsStore, SqliteRecordsStore};
pub use state::{next_status, DraftOperation, WorkflowStatus};

const MAX_CAS_ATTEMPTS: usize = 3;

/// One field of a draft as the reviewer sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftField {
    pub value: String,
    pub confidence: f32,
    pub needs_review: bool,
    /// Set once a reviewer confirmed or edited the value.
    #[serde(default)]
    pub acknowledged: bool,
    pub method: ExtractionMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrected_from: Option<String>,
    /// Region of the page image to highlight next to the value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceRegion>,
}

impl DraftField {
    fn from_value(value: &FieldValue) -> Self {
        Self {
            value: value.value.clone(),
            confidence: value.confidence,
            needs_review: value.needs_review,
            acknowledged: false,
            method: value.method,
            corrected_from: value.corrected_from.clone(),
            source: value.source,
        }
    }

    fn manual(value: String) -> Self {
        Self {
            value,
            confidence: 1.0,
            needs_review: false,
            acknowledged: true,
            method: ExtractionMethod::Manual,
            corrected_from: None,
            source: None,
        }
    }

    fn blocks_finalize(&self) -> bool {
        self.needs_review && !self.acknowledged
    }
}

/// Difference between the extracted value and the reviewer's value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldCorrection {
    pub original: String,
    pub corrected: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FusionDraft {
    pub id: String,
    pub job_id: String,
    pub page_id: String,
    pub tenant_id: String,
    pub record_type: RecordType,
    pub candidate_index: u32,
    pub row_index: Option<u32>,
    pub status: WorkflowStatus,
    pub confidence: f32,
    pub needs_review: bool,
    pub fields: BTreeMap<String, DraftField>,
    /// Fields exactly as the pipeline extracted them.
    pub original: BTreeMap<String, DraftField>,
    pub violations: Vec<Violation>,
    pub corrections: BTreeMap<String, FieldCorrection>,
    pub reviewer: Option<String>,
    pub rejection_reason: Option<String>,
    pub committed_record_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Payload column layout.
#[derive(Serialize, Deserialize)]
struct StoredPayload {
    fields: BTreeMap<String, DraftField>,
}

impl FusionDraft {
    pub fn from_row(row: DraftRow) -> Result<Self, DraftError> {
        let corrupt = |reason: String| DraftError::Corrupt {
            draft_id: row.id.clone(),
            reason,
        };
        let status: WorkflowStatus = row.workflow_status.parse().map_err(corrupt)?;
        let record_type: RecordType = row.record_type.parse().map_err(corrupt)?;
        let payload: StoredPayload = serde_json::from_str(&row.payload)?;
        let original: StoredPayload = serde_json::from_str(&row.original_payload)?;
        let violations = serde_json::from_str(&row.violations)?;
        let corrections = serde_json::from_str(&row.corrections)?;

        Ok(Self {
            id: row.id,
            job_id: row.job_id,
            page_id: row.page_id,
            tenant_id: row.tenant_id,
            record_type,
            candidate_index: row.candidate_index,
            row_index: row.row_index,
            status,
            confidence: row.confidence as f32,
            needs_review: row.needs_review,
            fields: payload.fields,
            original: original.fields,
            violations,
            corrections,
            reviewer: row.reviewer,
            rejection_reason: row.rejection_reason,
            committed_record_id: row.committed_record_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }

    fn to_row(&self) -> Result<DraftRow, DraftError> {
        Ok(DraftRow {
            id: self.id.clone(),
            job_id: self.job_id.clone(),
            page_id: self.page_id.clone(),
            tenant_id: self.tenant_id.clone(),
            record_type: self.record_type.as_str().to_string(),
            candidate_index: self.candidate_index,
            row_index: self.row_index,
            payload: serde_json::to_string(&StoredPayload {
                fields: self.fields.clone(),
            })?,
            original_payload: serde_json::to_string(&StoredPayload {
                fields: self.original.clone(),
            })?,
            workflow_status: self.status.as_str().to_string(),
            confidence: self.confidence as f64,
            needs_review: self.needs_review,
            violations: serde_json::to_string(&self.violations)?,
            corrections: serde_json::to_string(&self.corrections)?,
            reviewer: self.reviewer.clone(),
            rejection_reason: self.rejection_reason.clone(),
            committed_record_id: self.committed_record_id.clone(),
            created_at: self.created_at.clone(),
            updated_at: self.updated_at.clone(),
        })
    }

    pub fn value(&self, field: &str) -> Option<&str> {
        self.fields
            .get(field)
            .map(|f| f.value.as_str())
            .filter(|v| !v.trim().is_empty())
    }

    /// Fields a reviewer still has to confirm or correct before the draft
    /// can be finalized, sorted by name. Includes fields a violation names
    /// that were never extracted.
    pub fn unacknowledged(&self) -> Vec<String> {
        let mut pending: Vec<String> = self
            .fields
            .iter()
            .filter(|(_, f)| f.blocks_finalize())
            .map(|(name, _)| name.clone())
            .collect();
        for violation in &self.violations {
            for name in &violation.fields {
                if !self.fields.contains_key(name) && !pending.contains(name) {
                    pending.push(name.clone());
                }
            }
        }
        pending.sort();
        pending
    }

    /// Non-empty field values handed to the records store.
    pub fn final_values(&self) -> BTreeMap<String, String> {
        self.fields
            .iter()
            .filter(|(_, f)| !f.value.trim().is_empty())
            .map(|(name, f)| (name.clone(), f.value.trim().to_string()))
            .collect()
    }

    fn as_candidate(&self) -> RecordCandidate {
        let mut candidate = RecordCandidate::new(self.record_type);
        for (name, f) in &self.fields {
            candidate.fields.insert(
                name.clone(),
                FieldValue {
                    value: f.value.clone(),
                    confidence: f.confidence,
                    needs_review: f.needs_review,
                    method: f.method,
                    token_ids: Vec::new(),
                    ocr_confidence: f.confidence,
                    proximity: 1.0,
                    corrected_from: f.corrected_from.clone(),
                    source: f.source,
                },
            );
        }
        candidate
    }
}

/// Listing filters for the review queue.
#[derive(Debug, Default, Clone)]
pub struct ReviewFilter {
    pub record_type: Option<RecordType>,
    pub job_id: Option<String>,
    pub needs_review: Option<bool>,
    pub min_confidence: Option<f32>,
    pub max_confidence: Option<f32>,
    /// Defaults to drafts a reviewer still has to act on.
    pub statuses: Vec<WorkflowStatus>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Owns the draft lifecycle. The only mutation surface over extraction
/// results.
#[derive(Clone)]
pub struct DraftManager {
    db: Database,
    memory: CorrectionMemory,
    store: Arc<dyn RecordsStore>,
    age_tolerance_years: u32,
}

fn invalid(draft: &FusionDraft, operation: DraftOperation) -> DraftError {
    DraftError::InvalidStateTransition {
        draft_id: draft.id.clone(),
        from: draft.status,
        operation,
    }
}

impl DraftManager {
    pub fn new(
        db: Database,
        memory: CorrectionMemory,
        store: Arc<dyn RecordsStore>,
        age_tolerance_years: u32,
    ) -> Self {
        Self {
            db,
            memory,
            store,
            age_tolerance_years,
        }
    }

    /// Stores a candidate as a new draft. Re-creating the same
    /// `(page_id, candidate_index)` returns the existing draft, so a retried
    /// page never duplicates its drafts.
    pub fn create(
        &self,
        job_id: &str,
        page_id: &str,
        tenant_id: &str,
        candidate_index: u32,
        candidate: &RecordCandidate,
    ) -> Result<FusionDraft, DraftError> {
        let fields: BTreeMap<String, DraftField> = candidate
            .fields
            .iter()
            .map(|(name, value)| (name.clone(), DraftField::from_value(value)))
            .collect();
        let now = now();
        let draft = FusionDraft {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            page_id: page_id.to_string(),
            tenant_id: tenant_id.to_string(),
            record_type: candidate.record_type,
            candidate_index,
            row_index: candidate.row_index,
            status: WorkflowStatus::Draft,
            confidence: candidate.confidence,
            needs_review: candidate.needs_review,
            original: fields.clone(),
            fields,
            violations: candidate.violations.clone(),
            corrections: BTreeMap::new(),
            reviewer: None,
            rejection_reason: None,
            committed_record_id: None,
            created_at: now.clone(),
            updated_at: now,
        };

        let id = draft_repo::insert_if_absent(&self.db, &draft.to_row()?)?;
        if id != draft.id {
            log::debug!(
                "Draft for page {} candidate {} already exists as {}",
                page_id,
                candidate_index,
                id
            );
        }
        self.get(&id)
    }

    pub fn get(&self, id: &str) -> Result<FusionDraft, DraftError> {
        let row = draft_repo::find_by_id(&self.db, id)?
            .ok_or_else(|| DraftError::NotFound(id.to_string()))?;
        FusionDraft::from_row(row)
    }

    pub fn assign(&self, id: &str, reviewer: &str) -> Result<FusionDraft, DraftError> {
        let update = TransitionUpdate {
            reviewer: Some(reviewer),
            ..Default::default()
        };
        self.transition(id, DraftOperation::Assign, &update, |_| Ok(()))
    }

    /// Replaces field values. Each changed field is marked manual and
    /// acknowledged, its diff from the extracted value is kept on the draft
    /// and fed to the correction memory. The status does not change.
    pub fn edit(&self, id: &str, edits: &BTreeMap<String, String>) -> Result<FusionDraft, DraftError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut draft = self.get(id)?;
            next_status(draft.status, DraftOperation::Edit)
                .ok_or_else(|| invalid(&draft, DraftOperation::Edit))?;

            let mut changed = Vec::new();
            for (name, value) in edits {
                self.check_field(&draft, name)?;
                let value = value.trim();
                let original = draft
                    .original
                    .get(name)
                    .map(|f| f.value.clone())
                    .unwrap_or_default();
                let field = draft
                    .fields
                    .entry(name.clone())
                    .or_insert_with(|| DraftField::manual(String::new()));
                if field.value == value {
                    field.acknowledged = true;
                    continue;
                }
                *field = DraftField::manual(value.to_string());
                if original.trim() == value {
                    draft.corrections.remove(name);
                } else {
                    draft.corrections.insert(
                        name.clone(),
                        FieldCorrection {
                            original: original.clone(),
                            corrected: value.to_string(),
                        },
                    );
                }
                changed.push((name.as_str(), original, value));
            }

            self.revalidate(&mut draft);
            let expected = draft.status.as_str();
            if !draft_repo::update_payload(&self.db, &draft.to_row()?, expected, &now())? {
                continue;
            }

            for (name, original, value) in changed {
                if let Err(e) =
                    self.memory
                        .record_correction(&draft.tenant_id, draft.record_type, name, &original, value)
                {
                    log::warn!("Failed to record correction for draft {} field {}: {}", id, name, e);
                }
            }
            return self.get(id);
        }
        let draft = self.get(id)?;
        Err(invalid(&draft, DraftOperation::Edit))
    }

    /// Confirms values without changing them.
    pub fn acknowledge(&self, id: &str, fields: &[&str]) -> Result<FusionDraft, DraftError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut draft = self.get(id)?;
            next_status(draft.status, DraftOperation::Acknowledge)
                .ok_or_else(|| invalid(&draft, DraftOperation::Acknowledge))?;

            for name in fields {
                self.check_field(&draft, name)?;
                let field = draft.fields.entry(name.to_string()).or_insert_with(|| DraftField {
                    value: String::new(),
                    confidence: 0.0,
                    needs_review: true,
                    acknowledged: false,
                    method: ExtractionMethod::Manual,
                    corrected_from: None,
                    source: None,
                });
                field.acknowledged = true;
            }
            draft.needs_review = !draft.unacknowledged().is_empty();
            if draft_repo::update_payload(&self.db, &draft.to_row()?, draft.status.as_str(), &now())? {
                return self.get(id);
            }
        }
        let draft = self.get(id)?;
        Err(invalid(&draft, DraftOperation::Acknowledge))
    }

    /// `in_review` → `finalized`, once no flagged field is left unconfirmed.
    pub fn finalize(&self, id: &str) -> Result<FusionDraft, DraftError> {
        self.transition(id, DraftOperation::Finalize, &TransitionUpdate::default(), |draft| {
            let fields = draft.unacknowledged();
            if fields.is_empty() {
                Ok(())
            } else {
                Err(DraftError::UnacknowledgedFields {
                    draft_id: draft.id.clone(),
                    fields,
                })
            }
        })
    }

    /// Persists the final record and moves the draft to `committed`.
    /// Committing an already committed draft returns it unchanged.
    pub fn commit(&self, id: &str) -> Result<FusionDraft, DraftError> {
        let draft = self.get(id)?;
        match draft.status {
            WorkflowStatus::Committed => {
                log::debug!("Draft {} already committed", id);
                return Ok(draft);
            }
            WorkflowStatus::Finalized => {}
            _ => return Err(invalid(&draft, DraftOperation::Commit)),
        }

        let provenance = Provenance {
            tenant_id: draft.tenant_id.clone(),
            job_id: draft.job_id.clone(),
            page_id: draft.page_id.clone(),
            draft_id: draft.id.clone(),
        };
        let record_id = self
            .store
            .persist_record(draft.record_type, &draft.final_values(), &provenance)
            .map_err(|e| DraftError::RecordsStore {
                draft_id: id.to_string(),
                reason: e.to_string(),
            })?;

        let update = TransitionUpdate {
            committed_record_id: Some(&record_id),
            ..Default::default()
        };
        let won = draft_repo::compare_and_set_status(
            &self.db,
            id,
            WorkflowStatus::Finalized.as_str(),
            WorkflowStatus::Committed.as_str(),
            &update,
            &now(),
        )?;
        let current = self.get(id)?;
        if won {
            tracing::info!(draft_id = %id, record_id = %record_id, "Draft committed");
            return Ok(current);
        }
        match current.status {
            WorkflowStatus::Committed => Ok(current),
            _ => Err(invalid(&current, DraftOperation::Commit)),
        }
    }

    pub fn reject(&self, id: &str, reason: &str) -> Result<FusionDraft, DraftError> {
        let update = TransitionUpdate {
            rejection_reason: Some(reason),
            ..Default::default()
        };
        self.transition(id, DraftOperation::Reject, &update, |_| Ok(()))
    }

    /// Commits untouched drafts without review and records them as one
    /// batch. Drafts that already left `draft`, or whose record the store
    /// refuses, stay where they are and count as skipped.
    pub fn autocommit(
        &self,
        job_id: &str,
        tenant_id: &str,
        draft_ids: &[String],
        skipped: usize,
        threshold: f32,
    ) -> Result<AutoCommitBatch, DraftError> {
        let mut skipped = skipped;
        let mut persisted = Vec::new();
        for id in draft_ids {
            let draft = self.get(id)?;
            if next_status(draft.status, DraftOperation::AutoCommit).is_none() {
                skipped += 1;
                continue;
            }
            let provenance = Provenance {
                tenant_id: draft.tenant_id.clone(),
                job_id: draft.job_id.clone(),
                page_id: draft.page_id.clone(),
                draft_id: draft.id.clone(),
            };
            match self.store.persist_record(draft.record_type, &draft.final_values(), &provenance) {
                Ok(record_id) => persisted.push((draft.id, record_id)),
                Err(e) => {
                    tracing::warn!(draft_id = %id, error = %e, "Auto-commit could not persist record");
                    skipped += 1;
                }
            }
        }

        // Records written above are keyed on their draft, so if this
        // transaction fails a later manual commit reuses them.
        let batch_id = uuid::Uuid::new_v4().to_string();
        let created_at = now();
        let (committed, lost) = self.db.immediate(|conn| {
            autocommit_repo::insert_batch(
                conn,
                &BatchRow {
                    id: batch_id.clone(),
                    job_id: job_id.to_string(),
                    tenant_id: tenant_id.to_string(),
                    threshold: f64::from(threshold),
                    committed: 0,
                    skipped: 0,
                    created_at: created_at.clone(),
                    rolled_back_at: None,
                    rolled_back_by: None,
                },
            )?;
            let mut committed = Vec::new();
            let mut lost = Vec::new();
            for (draft_id, record_id) in persisted {
                let won = autocommit_repo::commit_draft(
                    conn,
                    &batch_id,
                    &draft_id,
                    &record_id,
                    autocommit::AUTOCOMMIT_ACTOR,
                    &created_at,
                )?;
                if won {
                    committed.push((draft_id, record_id));
                } else {
                    lost.push((draft_id, record_id));
                }
            }
            autocommit_repo::set_counts(conn, &batch_id, committed.len() as u32, (skipped + lost.len()) as u32)?;
            Ok((committed, lost))
        })?;

        // A draft taken by a reviewer meanwhile must not keep our record,
        // unless the reviewer already committed it under the same id.
        for (draft_id, record_id) in &lost {
            let current = self.get(draft_id)?;
            if current.committed_record_id.as_deref() == Some(record_id.as_str()) {
                continue;
            }
            if let Err(e) = self.store.delete_record(record_id) {
                tracing::warn!(draft_id = %draft_id, record_id = %record_id, error = %e, "Failed to remove unused record");
            }
        }

        tracing::info!(
            batch_id = %batch_id,
            job_id = %job_id,
            committed = committed.len(),
            skipped = skipped + lost.len(),
            "Auto-commit batch recorded"
        );
        Ok(AutoCommitBatch {
            id: batch_id,
            job_id: job_id.to_string(),
            tenant_id: tenant_id.to_string(),
            threshold,
            skipped: skipped + lost.len(),
            committed,
            created_at,
        })
    }

    /// Undoes an auto-commit batch: its records are deleted and its drafts
    /// go back to review. Rolling back twice changes nothing.
    pub fn rollback_batch(&self, batch_id: &str, actor: &str) -> Result<RollbackReport, DraftError> {
        let batch = autocommit_repo::find_batch(&self.db, batch_id)?
            .ok_or_else(|| DraftError::BatchNotFound(batch_id.to_string()))?;
        let mut report = RollbackReport {
            batch_id: batch_id.to_string(),
            ..Default::default()
        };
        if batch.rolled_back_at.is_some() {
            report.already_rolled_back = true;
            return Ok(report);
        }

        // Records go first: if reopening fails, a second rollback finds
        // them missing and finishes the job.
        let entries = autocommit_repo::entries(&self.db, batch_id)?;
        for entry in &entries {
            let deleted = self
                .store
                .delete_record(&entry.record_id)
                .map_err(|e| DraftError::RecordsStore {
                    draft_id: entry.draft_id.clone(),
                    reason: e.to_string(),
                })?;
            if deleted {
                report.deleted += 1;
            } else {
                report.missing += 1;
            }
        }

        let at = now();
        let reopened = self.db.immediate(|conn| {
            if !autocommit_repo::mark_rolled_back(conn, batch_id, actor, &at)? {
                return Ok(None);
            }
            let mut reopened = 0usize;
            for entry in &entries {
                if autocommit_repo::reopen_draft(conn, &entry.draft_id, &entry.record_id, &at)? {
                    reopened += 1;
                }
            }
            Ok(Some(reopened))
        })?;
        match reopened {
            Some(n) => report.reopened = n,
            None => report.already_rolled_back = true,
        }

        tracing::info!(
            batch_id = %batch_id,
            actor = %actor,
            deleted = report.deleted,
            missing = report.missing,
            reopened = report.reopened,
            "Auto-commit batch rolled back"
        );
        Ok(report)
    }

    pub fn autocommit_batches(&self, job_id: &str) -> Result<Vec<BatchRow>, DraftError> {
        Ok(autocommit_repo::batches_for_job(&self.db, job_id)?)
    }

    /// Drafts of a tenant still awaiting review (or in `filter.statuses`),
    /// oldest first, with the total count for paging.
    pub fn list_awaiting_review(
        &self,
        tenant_id: &str,
        filter: &ReviewFilter,
    ) -> Result<(Vec<FusionDraft>, u64), DraftError> {
        let statuses = if filter.statuses.is_empty() {
            WorkflowStatus::awaiting_review().to_vec()
        } else {
            filter.statuses.clone()
        };
        let query = DraftFilter {
            tenant_id: Some(tenant_id.to_string()),
            statuses: statuses.iter().map(|s| s.as_str().to_string()).collect(),
            record_type: filter.record_type.map(|rt| rt.as_str().to_string()),
            job_id: filter.job_id.clone(),
            needs_review: filter.needs_review,
            min_confidence: filter.min_confidence.map(f64::from),
            max_confidence: filter.max_confidence.map(f64::from),
            limit: filter.limit,
            offset: filter.offset,
        };
        let (rows, total) = draft_repo::query(&self.db, &query)?;
        let drafts = rows
            .into_iter()
            .map(FusionDraft::from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((drafts, total))
    }

    fn transition<G>(
        &self,
        id: &str,
        operation: DraftOperation,
        update: &TransitionUpdate<'_>,
        guard: G,
    ) -> Result<FusionDraft, DraftError>
    where
        G: Fn(&FusionDraft) -> Result<(), DraftError>,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let draft = self.get(id)?;
            let next = next_status(draft.status, operation).ok_or_else(|| invalid(&draft, operation))?;
            guard(&draft)?;
            if draft_repo::compare_and_set_status(
                &self.db,
                id,
                draft.status.as_str(),
                next.as_str(),
                update,
                &now(),
            )? {
                log::debug!("Draft {}: {} {} -> {}", id, operation, draft.status, next);
                return self.get(id);
            }
        }
        let draft = self.get(id)?;
        Err(invalid(&draft, operation))
    }

    fn check_field(&self, draft: &FusionDraft, name: &str) -> Result<(), DraftError> {
        let canonical = draft.record_type.canonical_fields().iter().any(|f| *f == name);
        if canonical || draft.fields.contains_key(name) {
            Ok(())
        } else {
            Err(DraftError::UnknownField {
                draft_id: draft.id.clone(),
                field: name.to_string(),
            })
        }
    }

    /// Re-runs the cross-field checks against the edited values.
    fn revalidate(&self, draft: &mut FusionDraft) {
        let found = validate::check(&draft.as_candidate(), self.age_tolerance_years);
        for violation in &found {
            for name in &violation.fields {
                if let Some(field) = draft.fields.get_mut(name) {
                    field.needs_review = true;
                }
            }
        }
        draft
            .violations
            .retain(|v| v.code == ViolationCode::LowImageQuality);
        draft.violations.extend(found);
        draft.confidence = combine_confidence(
            draft.record_type,
            draft
                .fields
                .iter()
                .map(|(name, f)| (name.as_str(), f.value.as_str(), f.confidence)),
        );
        draft.needs_review = !draft.unacknowledged().is_empty();
    }
}
