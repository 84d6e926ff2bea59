//! Recognition cache index and per-call usage log.

use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use super::{Database, DatabaseError};

/// One billable (or cache-served) recognition call.
#[derive(Debug, Clone)]
pub struct UsageEntry {
    pub tenant_id: String,
    pub job_id: Option<String>,
    pub page_id: Option<String>,
    pub engine: String,
    pub content_hash: String,
    pub cached: bool,
    pub pages: u32,
    pub cost_micros: u64,
    pub created_at: String,
}

/// Aggregate usage over a time range.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub calls: u64,
    pub cached_calls: u64,
    pub pages: u64,
    pub cost_micros: u64,
}

/// Looks up the raw OCR artifact previously stored for an image hash.
pub fn cache_lookup(
    db: &Database,
    content_hash: &str,
    engine: &str,
) -> Result<Option<String>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT artifact_ref FROM ocr_cache WHERE content_hash = ?1 AND engine = ?2",
                params![content_hash, engine],
                |r| r.get(0),
            )
            .optional()?)
    })
}

pub fn cache_store(
    db: &Database,
    content_hash: &str,
    engine: &str,
    artifact_ref: &str,
    now: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT OR IGNORE INTO ocr_cache (content_hash, engine, artifact_ref, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![content_hash, engine, artifact_ref, now],
        )?;
        Ok(())
    })
}

/// Drops cache rows whose artifact was removed by retention cleanup.
pub fn cache_forget(db: &Database, artifact_ref: &str) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn.execute(
            "DELETE FROM ocr_cache WHERE artifact_ref = ?1",
            params![artifact_ref],
        )?)
    })
}

pub fn record_usage(db: &Database, entry: &UsageEntry) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO ocr_usage (tenant_id, job_id, page_id, engine, content_hash, cached,
             pages, cost_micros, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.tenant_id,
                entry.job_id,
                entry.page_id,
                entry.engine,
                entry.content_hash,
                entry.cached,
                entry.pages,
                entry.cost_micros as i64,
                entry.created_at,
            ],
        )?;
        Ok(())
    })
}

/// Summarizes usage for a tenant, optionally bounded by `[from, to]`.
pub fn summarize(
    db: &Database,
    tenant_id: &str,
    from: Option<&str>,
    to: Option<&str>,
) -> Result<UsageSummary, DatabaseError> {
    db.with_conn(|conn| {
        let summary = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(cached), 0), COALESCE(SUM(pages), 0),
             COALESCE(SUM(cost_micros), 0)
             FROM ocr_usage
             WHERE tenant_id = ?1
               AND (?2 IS NULL OR created_at >= ?2)
               AND (?3 IS NULL OR created_at <= ?3)",
            params![tenant_id, from, to],
            |r| {
                Ok(UsageSummary {
                    calls: r.get::<_, i64>(0)? as u64,
                    cached_calls: r.get::<_, i64>(1)? as u64,
                    pages: r.get::<_, i64>(2)? as u64,
                    cost_micros: r.get::<_, i64>(3)? as u64,
                })
            },
        )?;
        Ok(summary)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(cached: bool, cost: u64, at: &str) -> UsageEntry {
        UsageEntry {
            tenant_id: "holy-trinity".to_string(),
            job_id: Some("j".to_string()),
            page_id: Some("p".to_string()),
            engine: "vision".to_string(),
            content_hash: "abc".to_string(),
            cached,
            pages: 1,
            cost_micros: cost,
            created_at: at.to_string(),
        }
    }

    #[test]
    fn test_cache_roundtrip_is_first_write_wins() {
        let db = Database::open_in_memory().unwrap();
        assert!(cache_lookup(&db, "h", "vision").unwrap().is_none());
        cache_store(&db, "h", "vision", "raw_ocr/aa/first", "2026-01-01T00:00:00.000Z").unwrap();
        cache_store(&db, "h", "vision", "raw_ocr/aa/second", "2026-01-01T00:00:00.000Z").unwrap();
        assert_eq!(
            cache_lookup(&db, "h", "vision").unwrap().as_deref(),
            Some("raw_ocr/aa/first")
        );
        assert!(cache_lookup(&db, "h", "tesseract").unwrap().is_none());

        assert_eq!(cache_forget(&db, "raw_ocr/aa/first").unwrap(), 1);
        assert!(cache_lookup(&db, "h", "vision").unwrap().is_none());
    }

    #[test]
    fn test_summarize_usage() {
        let db = Database::open_in_memory().unwrap();
        record_usage(&db, &entry(false, 1500, "2026-01-01T00:00:00.000Z")).unwrap();
        record_usage(&db, &entry(true, 0, "2026-01-02T00:00:00.000Z")).unwrap();
        record_usage(&db, &entry(false, 1500, "2026-02-01T00:00:00.000Z")).unwrap();

        let all = summarize(&db, "holy-trinity", None, None).unwrap();
        assert_eq!(
            all,
            UsageSummary {
                calls: 3,
                cached_calls: 1,
                pages: 3,
                cost_micros: 3000
            }
        );

        let january = summarize(
            &db,
            "holy-trinity",
            Some("2026-01-01T00:00:00.000Z"),
            Some("2026-01-31T23:59:59.999Z"),
        )
        .unwrap();
        assert_eq!(january.calls, 2);
        assert_eq!(january.cost_micros, 1500);

        assert_eq!(summarize(&db, "other", None, None).unwrap(), UsageSummary::default());
    }
}
