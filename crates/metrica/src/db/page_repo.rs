//! Page repository: per-page state and artifact references.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Database, DatabaseError};

#[derive(Debug, Clone, PartialEq)]
pub struct PageRow {
    pub id: String,
    pub job_id: String,
    pub ordinal: u32,
    pub filename: String,
    pub status: String,
    pub quality_score: Option<f64>,
    pub needs_review: bool,
    pub detected_language: Option<String>,
    pub record_type: Option<String>,
    pub classification_confidence: Option<f64>,
    pub source_ref: String,
    pub preprocessed_ref: Option<String>,
    pub raw_ocr_ref: Option<String>,
    pub tokens_ref: Option<String>,
    pub candidates_ref: Option<String>,
    pub error: Option<String>,
    pub user_message: Option<String>,
    pub updated_at: String,
}

impl PageRow {
    pub fn new(
        id: String,
        job_id: &str,
        ordinal: u32,
        filename: &str,
        source_ref: String,
        now: &str,
    ) -> Self {
        Self {
            id,
            job_id: job_id.to_string(),
            ordinal,
            filename: filename.to_string(),
            status: "pending".to_string(),
            quality_score: None,
            needs_review: false,
            detected_language: None,
            record_type: None,
            classification_confidence: None,
            source_ref,
            preprocessed_ref: None,
            raw_ocr_ref: None,
            tokens_ref: None,
            candidates_ref: None,
            error: None,
            user_message: None,
            updated_at: now.to_string(),
        }
    }

    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            ordinal: row.get("ordinal")?,
            filename: row.get("filename")?,
            status: row.get("status")?,
            quality_score: row.get("quality_score")?,
            needs_review: row.get("needs_review")?,
            detected_language: row.get("detected_language")?,
            record_type: row.get("record_type")?,
            classification_confidence: row.get("classification_confidence")?,
            source_ref: row.get("source_ref")?,
            preprocessed_ref: row.get("preprocessed_ref")?,
            raw_ocr_ref: row.get("raw_ocr_ref")?,
            tokens_ref: row.get("tokens_ref")?,
            candidates_ref: row.get("candidates_ref")?,
            error: row.get("error")?,
            user_message: row.get("user_message")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

pub fn insert(conn: &Connection, page: &PageRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO pages (id, job_id, ordinal, filename, status, quality_score, needs_review,
         detected_language, record_type, classification_confidence, source_ref,
         preprocessed_ref, raw_ocr_ref, tokens_ref, candidates_ref, error, user_message,
         updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            page.id,
            page.job_id,
            page.ordinal,
            page.filename,
            page.status,
            page.quality_score,
            page.needs_review,
            page.detected_language,
            page.record_type,
            page.classification_confidence,
            page.source_ref,
            page.preprocessed_ref,
            page.raw_ocr_ref,
            page.tokens_ref,
            page.candidates_ref,
            page.error,
            page.user_message,
            page.updated_at,
        ],
    )?;
    Ok(())
}

/// Overwrites all mutable columns of a page.
pub fn update(db: &Database, page: &PageRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE pages SET status = ?2, quality_score = ?3, needs_review = ?4,
             detected_language = ?5, record_type = ?6, classification_confidence = ?7,
             preprocessed_ref = ?8, raw_ocr_ref = ?9, tokens_ref = ?10, candidates_ref = ?11,
             error = ?12, user_message = ?13, updated_at = ?14
             WHERE id = ?1",
            params![
                page.id,
                page.status,
                page.quality_score,
                page.needs_review,
                page.detected_language,
                page.record_type,
                page.classification_confidence,
                page.preprocessed_ref,
                page.raw_ocr_ref,
                page.tokens_ref,
                page.candidates_ref,
                page.error,
                page.user_message,
                page.updated_at,
            ],
        )?;
        Ok(())
    })
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<PageRow>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row("SELECT * FROM pages WHERE id = ?1", params![id], PageRow::from_row)
            .optional()?)
    })
}

/// All pages of a job in ordinal order.
pub fn list_for_job(db: &Database, job_id: &str) -> Result<Vec<PageRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM pages WHERE job_id = ?1 ORDER BY ordinal")?;
        let rows = stmt
            .query_map(params![job_id], PageRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

pub fn set_status(db: &Database, id: &str, status: &str, now: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE pages SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status, now],
        )?;
        Ok(())
    })
}

/// Moves every page of a job still in `from` to `to`. Returns the count.
pub fn transition_all(
    db: &Database,
    job_id: &str,
    from: &[&str],
    to: &str,
    now: &str,
) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let mut changed = 0;
        for status in from {
            changed += conn.execute(
                "UPDATE pages SET status = ?3, updated_at = ?4 WHERE job_id = ?1 AND status = ?2",
                params![job_id, status, to, now],
            )?;
        }
        Ok(changed)
    })
}
