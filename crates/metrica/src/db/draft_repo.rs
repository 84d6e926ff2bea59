//! Draft repository. JSON columns are kept as strings here; the draft
//! manager owns their shape.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

#[derive(Debug, Clone)]
pub struct DraftRow {
    pub id: String,
    pub job_id: String,
    pub page_id: String,
    pub tenant_id: String,
    pub record_type: String,
    pub candidate_index: u32,
    pub row_index: Option<u32>,
    pub payload: String,
    pub original_payload: String,
    pub workflow_status: String,
    pub confidence: f64,
    pub needs_review: bool,
    pub violations: String,
    pub corrections: String,
    pub reviewer: Option<String>,
    pub rejection_reason: Option<String>,
    pub committed_record_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl DraftRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            page_id: row.get("page_id")?,
            tenant_id: row.get("tenant_id")?,
            record_type: row.get("record_type")?,
            candidate_index: row.get("candidate_index")?,
            row_index: row.get("row_index")?,
            payload: row.get("payload")?,
            original_payload: row.get("original_payload")?,
            workflow_status: row.get("workflow_status")?,
            confidence: row.get("confidence")?,
            needs_review: row.get("needs_review")?,
            violations: row.get("violations")?,
            corrections: row.get("corrections")?,
            reviewer: row.get("reviewer")?,
            rejection_reason: row.get("rejection_reason")?,
            committed_record_id: row.get("committed_record_id")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Filters for listing drafts.
#[derive(Debug, Default, Clone)]
pub struct DraftFilter {
    pub tenant_id: Option<String>,
    pub statuses: Vec<String>,
    pub record_type: Option<String>,
    pub job_id: Option<String>,
    pub needs_review: Option<bool>,
    pub min_confidence: Option<f64>,
    pub max_confidence: Option<f64>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Inserts a draft unless one already exists for `(page_id, candidate_index)`.
/// Returns the id of the stored draft (the existing one on conflict).
pub fn insert_if_absent(db: &Database, draft: &DraftRow) -> Result<String, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT OR IGNORE INTO drafts (id, job_id, page_id, tenant_id, record_type,
             candidate_index, row_index, payload, original_payload, workflow_status, confidence,
             needs_review, violations, corrections, reviewer, rejection_reason,
             committed_record_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                draft.id,
                draft.job_id,
                draft.page_id,
                draft.tenant_id,
                draft.record_type,
                draft.candidate_index,
                draft.row_index,
                draft.payload,
                draft.original_payload,
                draft.workflow_status,
                draft.confidence,
                draft.needs_review,
                draft.violations,
                draft.corrections,
                draft.reviewer,
                draft.rejection_reason,
                draft.committed_record_id,
                draft.created_at,
                draft.updated_at,
            ],
        )?;
        let id = conn.query_row(
            "SELECT id FROM drafts WHERE page_id = ?1 AND candidate_index = ?2",
            params![draft.page_id, draft.candidate_index],
            |r| r.get(0),
        )?;
        Ok(id)
    })
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<DraftRow>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row("SELECT * FROM drafts WHERE id = ?1", params![id], DraftRow::from_row)
            .optional()?)
    })
}

/// Field changes applied by a status transition.
#[derive(Debug, Default, Clone)]
pub struct TransitionUpdate<'a> {
    pub reviewer: Option<&'a str>,
    pub rejection_reason: Option<&'a str>,
    pub committed_record_id: Option<&'a str>,
}

/// Moves a draft from `expected` to `next`. Returns `false` if the draft was
/// not in `expected` (someone else moved it first).
pub fn compare_and_set_status(
    db: &Database,
    id: &str,
    expected: &str,
    next: &str,
    update: &TransitionUpdate<'_>,
    now: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE drafts SET workflow_status = ?3,
               reviewer = COALESCE(?4, reviewer),
               rejection_reason = COALESCE(?5, rejection_reason),
               committed_record_id = COALESCE(?6, committed_record_id),
               updated_at = ?7
             WHERE id = ?1 AND workflow_status = ?2",
            params![
                id,
                expected,
                next,
                update.reviewer,
                update.rejection_reason,
                update.committed_record_id,
                now,
            ],
        )?;
        Ok(changed == 1)
    })
}

/// Replaces the editable columns while the draft is still in `expected`.
pub fn update_payload(
    db: &Database,
    draft: &DraftRow,
    expected: &str,
    now: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE drafts SET payload = ?3, corrections = ?4, needs_review = ?5, confidence = ?6,
             updated_at = ?7
             WHERE id = ?1 AND workflow_status = ?2",
            params![
                draft.id,
                expected,
                draft.payload,
                draft.corrections,
                draft.needs_review,
                draft.confidence,
                now,
            ],
        )?;
        Ok(changed == 1)
    })
}

/// Queries drafts with filters, returning (rows, total_count). Oldest first,
/// so reviewers work through a backlog in arrival order.
pub fn query(db: &Database, filter: &DraftFilter) -> Result<(Vec<DraftRow>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref tenant_id) = filter.tenant_id {
            conditions.push(format!("tenant_id = ?{}", param_values.len() + 1));
            param_values.push(Box::new(tenant_id.clone()));
        }
        if !filter.statuses.is_empty() {
            let mut placeholders = Vec::new();
            for status in &filter.statuses {
                placeholders.push(format!("?{}", param_values.len() + 1));
                param_values.push(Box::new(status.clone()));
            }
            conditions.push(format!("workflow_status IN ({})", placeholders.join(", ")));
        }
        if let Some(ref record_type) = filter.record_type {
            conditions.push(format!("record_type = ?{}", param_values.len() + 1));
            param_values.push(Box::new(record_type.clone()));
        }
        if let Some(ref job_id) = filter.job_id {
            conditions.push(format!("job_id = ?{}", param_values.len() + 1));
            param_values.push(Box::new(job_id.clone()));
        }
        if let Some(needs_review) = filter.needs_review {
            conditions.push(format!("needs_review = ?{}", param_values.len() + 1));
            param_values.push(Box::new(needs_review));
        }
        if let Some(min) = filter.min_confidence {
            conditions.push(format!("confidence >= ?{}", param_values.len() + 1));
            param_values.push(Box::new(min));
        }
        if let Some(max) = filter.max_confidence {
            conditions.push(format!("confidence <= ?{}", param_values.len() + 1));
            param_values.push(Box::new(max));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM drafts {}", where_clause);
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

        let limit = filter.limit.unwrap_or(100) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;
        param_values.push(Box::new(limit));
        param_values.push(Box::new(offset));
        let query_sql = format!(
            "SELECT * FROM drafts {} ORDER BY created_at, page_id, candidate_index LIMIT ?{} OFFSET ?{}",
            where_clause,
            param_values.len() - 1,
            param_values.len()
        );

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&query_sql)?;
        let rows: Vec<DraftRow> = stmt
            .query_map(params_ref.as_slice(), DraftRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((rows, total))
    })
}

/// Number of drafts per page of a job, keyed by page id.
pub fn count_by_page(
    db: &Database,
    job_id: &str,
) -> Result<std::collections::HashMap<String, u32>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT page_id, COUNT(*) FROM drafts WHERE job_id = ?1 GROUP BY page_id")?;
        let rows = stmt
            .query_map(params![job_id], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<std::collections::HashMap<_, _>, _>>()?;
        Ok(rows)
    })
}
