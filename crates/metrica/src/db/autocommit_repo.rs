//! Auto-commit batches: which drafts were committed without review, and
//! the records they produced, so a whole batch can be undone.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Database, DatabaseError};

#[derive(Debug, Clone, PartialEq)]
pub struct BatchRow {
    pub id: String,
    pub job_id: String,
    pub tenant_id: String,
    pub threshold: f64,
    pub committed: u32,
    pub skipped: u32,
    pub created_at: String,
    pub rolled_back_at: Option<String>,
    pub rolled_back_by: Option<String>,
}

impl BatchRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            tenant_id: row.get("tenant_id")?,
            threshold: row.get("threshold")?,
            committed: row.get("committed")?,
            skipped: row.get("skipped")?,
            created_at: row.get("created_at")?,
            rolled_back_at: row.get("rolled_back_at")?,
            rolled_back_by: row.get("rolled_back_by")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRow {
    pub draft_id: String,
    pub record_id: String,
}

pub fn insert_batch(conn: &Connection, batch: &BatchRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO autocommit_batches (id, job_id, tenant_id, threshold, committed, skipped,
         created_at, rolled_back_at, rolled_back_by)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            batch.id,
            batch.job_id,
            batch.tenant_id,
            batch.threshold,
            batch.committed,
            batch.skipped,
            batch.created_at,
            batch.rolled_back_at,
            batch.rolled_back_by,
        ],
    )?;
    Ok(())
}

/// Moves an untouched draft straight to `committed` and records it in the
/// batch. Returns `false` if the draft already left `draft`.
pub fn commit_draft(
    conn: &Connection,
    batch_id: &str,
    draft_id: &str,
    record_id: &str,
    reviewer: &str,
    now: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE drafts SET workflow_status = 'committed', committed_record_id = ?2, reviewer = ?3,
         updated_at = ?4
         WHERE id = ?1 AND workflow_status = 'draft'",
        params![draft_id, record_id, reviewer, now],
    )?;
    if changed == 0 {
        return Ok(false);
    }
    conn.execute(
        "INSERT INTO autocommit_entries (batch_id, draft_id, record_id) VALUES (?1, ?2, ?3)",
        params![batch_id, draft_id, record_id],
    )?;
    Ok(true)
}

pub fn set_counts(conn: &Connection, batch_id: &str, committed: u32, skipped: u32) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE autocommit_batches SET committed = ?2, skipped = ?3 WHERE id = ?1",
        params![batch_id, committed, skipped],
    )?;
    Ok(())
}

pub fn find_batch(db: &Database, id: &str) -> Result<Option<BatchRow>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT * FROM autocommit_batches WHERE id = ?1",
                params![id],
                BatchRow::from_row,
            )
            .optional()?)
    })
}

pub fn batches_for_job(db: &Database, job_id: &str) -> Result<Vec<BatchRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM autocommit_batches WHERE job_id = ?1 ORDER BY created_at")?;
        let rows = stmt
            .query_map(params![job_id], BatchRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

pub fn entries(db: &Database, batch_id: &str) -> Result<Vec<EntryRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT draft_id, record_id FROM autocommit_entries WHERE batch_id = ?1 ORDER BY draft_id",
        )?;
        let rows = stmt
            .query_map(params![batch_id], |r| {
                Ok(EntryRow {
                    draft_id: r.get(0)?,
                    record_id: r.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Sends a committed draft back to review, provided it still points at
/// `record_id`. Returns `false` otherwise.
pub fn reopen_draft(conn: &Connection, draft_id: &str, record_id: &str, now: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE drafts SET workflow_status = 'in_review', committed_record_id = NULL, reviewer = NULL,
         needs_review = 1, updated_at = ?3
         WHERE id = ?1 AND workflow_status = 'committed' AND committed_record_id = ?2",
        params![draft_id, record_id, now],
    )?;
    Ok(changed == 1)
}

/// Stamps the batch as rolled back. Returns `false` if it already was.
pub fn mark_rolled_back(conn: &Connection, batch_id: &str, actor: &str, now: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE autocommit_batches SET rolled_back_at = ?2, rolled_back_by = ?3
         WHERE id = ?1 AND rolled_back_at IS NULL",
        params![batch_id, now, actor],
    )?;
    Ok(changed == 1)
}
