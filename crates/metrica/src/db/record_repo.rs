//! Committed sacramental records (the local records store).

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRow {
    pub id: String,
    pub tenant_id: String,
    pub record_type: String,
    pub fields: String,
    pub source_job_id: String,
    pub source_page_id: String,
    pub source_draft_id: String,
    pub created_at: String,
}

impl RecordRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            tenant_id: row.get("tenant_id")?,
            record_type: row.get("record_type")?,
            fields: row.get("fields")?,
            source_job_id: row.get("source_job_id")?,
            source_page_id: row.get("source_page_id")?,
            source_draft_id: row.get("source_draft_id")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Inserts a record unless one already exists for the same source draft.
/// Returns the id of the stored record.
pub fn insert_once(db: &Database, record: &RecordRow) -> Result<String, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT OR IGNORE INTO records (id, tenant_id, record_type, fields, source_job_id,
             source_page_id, source_draft_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id,
                record.tenant_id,
                record.record_type,
                record.fields,
                record.source_job_id,
                record.source_page_id,
                record.source_draft_id,
                record.created_at,
            ],
        )?;
        let id = conn.query_row(
            "SELECT id FROM records WHERE source_draft_id = ?1",
            params![record.source_draft_id],
            |r| r.get(0),
        )?;
        Ok(id)
    })
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<RecordRow>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row("SELECT * FROM records WHERE id = ?1", params![id], RecordRow::from_row)
            .optional()?)
    })
}

/// Removes a record. Returns `false` when it was already gone.
pub fn delete(db: &Database, id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| Ok(conn.execute("DELETE FROM records WHERE id = ?1", params![id])? == 1))
}

pub fn count_for_tenant(db: &Database, tenant_id: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM records WHERE tenant_id = ?1",
            params![tenant_id],
            |r| r.get(0),
        )?)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, draft: &str) -> RecordRow {
        RecordRow {
            id: id.to_string(),
            tenant_id: "t".to_string(),
            record_type: "marriage".to_string(),
            fields: "{}".to_string(),
            source_job_id: "j".to_string(),
            source_page_id: "p".to_string(),
            source_draft_id: draft.to_string(),
            created_at: "2026-01-01T00:00:00.000Z".to_string(),
        }
    }

    #[test]
    fn test_insert_once_per_draft() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(insert_once(&db, &record("r1", "d1")).unwrap(), "r1");
        assert_eq!(insert_once(&db, &record("r2", "d1")).unwrap(), "r1");
        assert_eq!(insert_once(&db, &record("r3", "d2")).unwrap(), "r3");
        assert_eq!(count_for_tenant(&db, "t").unwrap(), 2);
        assert!(find_by_id(&db, "r2").unwrap().is_none());
    }

    #[test]
    fn test_delete_reports_missing_rows() {
        let db = Database::open_in_memory().unwrap();
        insert_once(&db, &record("r1", "d1")).unwrap();
        assert!(delete(&db, "r1").unwrap());
        assert!(!delete(&db, "r1").unwrap());
        assert_eq!(count_for_tenant(&db, "t").unwrap(), 0);

        // The draft can be committed again once its record is gone.
        assert_eq!(insert_once(&db, &record("r4", "d1")).unwrap(), "r4");
    }
}
